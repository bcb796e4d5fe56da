//! Superblock persistence for OpenDB.
//!
//! A chain layer that has been persisted no longer keeps its blocks,
//! operations and object versions in memory; it reads them through the
//! [`BlockDbAccess`] trait. Writes (persisting a layer, merging two
//! persisted layers, unloading one) are issued by the persistence manager
//! in `odb-chain`, never by the chain engine.
//!
//! # Backends
//!
//! - [`InMemorySuperblockDb`] -- one superblock held behind a `RwLock`, with
//!   a stale flag set when the superblock is merged away.

pub mod error;
pub mod memory;
pub mod object;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::{InMemorySuperblockDb, SuperblockSnapshot};
pub use object::{StoredObject, Tombstone};
pub use traits::BlockDbAccess;

//! Layered chain engine for OpenDB.
//!
//! This crate holds the chain itself. It provides:
//! - [`OpBlockChain`], one layer of blocks plus a queue of pending operations
//! - Operation preparation: duplicate checks, delete/create/edit resolution,
//!   references and vote finalization, then the consensus rules
//! - Block creation and replication, queue rebase and selective removal
//! - The layer lock machine ([`ChainStatus`])
//! - Persistence and compaction of layers through [`PersistenceManager`]
//!
//! Layers form a singly linked list towards the root. A layer that becomes a
//! parent is frozen; lookups fall through the list newest first, and a
//! tombstone in a newer layer hides every older version of an object.

pub mod chain;
pub mod config;
pub mod error;
pub mod history;
pub mod persistence;
pub mod status;

mod lookup;
mod prepare;
mod store;

#[cfg(test)]
mod testing;

pub use chain::OpBlockChain;
pub use config::ChainConfig;
pub use error::{ChainError, ChainResult};
pub use history::DeletedObjectCtx;
pub use persistence::{Compaction, PersistenceManager};
pub use status::ChainStatus;

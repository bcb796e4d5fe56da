//! # odb-types
//!
//! Object model for OpenDB.
//!
//! Everything stored in the database is a JSON object: [`OpObject`] values
//! keyed by a [`CompoundKey`], changed by signed [`Operation`]s that are
//! batched into hash-linked [`Block`]s. Hashing, signing and validation
//! live in higher crates; this crate only knows the shapes and their
//! canonical JSON form.

pub mod block;
pub mod delete_info;
pub mod error;
pub mod hash;
pub mod json;
pub mod key;
pub mod object;
pub mod operation;

pub use block::Block;
pub use delete_info::OperationDeleteInfo;
pub use error::TypeError;
pub use hash::{raw_hash, superblock_hash};
pub use key::CompoundKey;
pub use object::OpObject;
pub use operation::Operation;

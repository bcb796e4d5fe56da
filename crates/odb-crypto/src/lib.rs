//! Cryptographic primitives for OpenDB.
//!
//! Provides SHA-256 hashing in the `algo:hex` string form used throughout
//! the database, binary merkle trees over operation hashes and signatures,
//! and secp256k1 ECDSA keys with their `base64:<format>:<der>` encodings.
//!
//! All crypto operations wrap established libraries (`sha2`, `k256`).

pub mod error;
pub mod hasher;
pub mod merkle;
pub mod signer;

pub use error::CryptoError;
pub use hasher::{hash_bytes, ContentHasher};
pub use merkle::{MerkleProof, MerkleTree, Side};
pub use signer::{decode_signature, KeyPair, SignatureAlgo, SigningKey, VerifyingKey};

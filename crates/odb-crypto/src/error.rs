/// Errors from hashing, key handling and signing.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("algorithm is not supported: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("private and public key do not match")]
    KeyMismatch,

    #[error("unknown format for signature '{0}'")]
    InvalidSignatureFormat(String),

    #[error("invalid hash '{0}'")]
    InvalidHash(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

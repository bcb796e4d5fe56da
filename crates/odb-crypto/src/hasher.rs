use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Content hasher producing `algo:hex` strings.
///
/// Salted hashes concatenate salt and message bytes before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHasher {
    algo: &'static str,
}

impl ContentHasher {
    /// SHA-256, the only algorithm used for operations, blocks and merkle nodes.
    pub const SHA256: Self = Self { algo: "sha256" };

    /// Look up a hasher by its algorithm prefix.
    pub fn for_algo(algo: &str) -> Result<Self, CryptoError> {
        match algo {
            "sha256" => Ok(Self::SHA256),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn algo(&self) -> &'static str {
        self.algo
    }

    /// Raw digest of `data`.
    pub fn digest(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    /// Digest of `left || right`.
    pub fn digest_pair(&self, left: &[u8], right: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }

    /// `algo:hex(digest)`.
    pub fn format(&self, digest: &[u8]) -> String {
        format!("{}:{}", self.algo, hex::encode(digest))
    }

    /// Hash bytes and format the result.
    pub fn hash_formatted(&self, data: &[u8]) -> String {
        self.format(&self.digest(data))
    }

    /// Hash `salt || msg` (UTF-8) and format the result.
    pub fn hash_with_salt(&self, salt: Option<&str>, msg: &str) -> String {
        let digest = self.digest_pair(salt.unwrap_or("").as_bytes(), msg.as_bytes());
        self.format(&digest)
    }

    /// Check a formatted hash against `salt || msg`, using the algorithm named
    /// in the hash prefix.
    pub fn validate(hash: &str, salt: Option<&str>, msg: &str) -> Result<bool, CryptoError> {
        let (algo, _) = hash
            .split_once(':')
            .ok_or_else(|| CryptoError::InvalidHash(hash.to_string()))?;
        Ok(Self::for_algo(algo)?.hash_with_salt(salt, msg) == hash)
    }
}

/// Decode the hex part of an `algo:hex` hash. An empty string is an
/// empty byte array.
pub fn hash_bytes(hash: &str) -> Result<Vec<u8>, CryptoError> {
    if hash.is_empty() {
        return Ok(Vec::new());
    }
    let hex_part = match hash.rfind(':') {
        Some(i) => &hash[i + 1..],
        None => hash,
    };
    hex::decode(hex_part).map_err(|_| CryptoError::InvalidHash(hash.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            ContentHasher::SHA256.hash_formatted(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn pair_equals_concatenation() {
        let h = ContentHasher::SHA256;
        assert_eq!(h.digest_pair(b"ab", b"c"), h.digest(b"abc"));
    }

    #[test]
    fn salted_hash_validates() {
        let h = ContentHasher::SHA256.hash_with_salt(Some("salt"), "pwd");
        assert!(ContentHasher::validate(&h, Some("salt"), "pwd").unwrap());
        assert!(!ContentHasher::validate(&h, Some("other"), "pwd").unwrap());
        assert!(ContentHasher::validate("nocolon", None, "x").is_err());
        assert!(ContentHasher::validate("md5:00", None, "x").is_err());
    }

    #[test]
    fn hash_bytes_strips_prefixes() {
        assert_eq!(hash_bytes("json:sha256:0aff").unwrap(), vec![0x0a, 0xff]);
        assert_eq!(hash_bytes("0aff").unwrap(), vec![0x0a, 0xff]);
        assert!(hash_bytes("").unwrap().is_empty());
        assert!(hash_bytes("sha256:zz").is_err());
    }
}

//! secp256k1 ECDSA keys and signatures.
//!
//! Keys travel as `base64:X.509:<spki der>` (public) and
//! `base64:PKCS#8:<pkcs8 der>` (private). Signatures travel as
//! `<algo>:base64:<der>` where `algo` is `ECDSA` (the message is signed
//! as is, normally a 32-byte hash) or `SHA256withECDSA` (the message is
//! hashed first).

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose, Engine as _};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::Signature;
use k256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};

use crate::error::CryptoError;

/// Key algorithm name stored in login and signup objects.
pub const ALGO_EC: &str = "EC";
pub const KEY_BASE64: &str = "base64";
pub const FORMAT_X509: &str = "X.509";
pub const FORMAT_PKCS8: &str = "PKCS#8";

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgo {
    /// Sign the message bytes directly.
    Ecdsa,
    /// Hash the message with SHA-256, then sign.
    Sha256WithEcdsa,
}

impl SignatureAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ecdsa => "ECDSA",
            Self::Sha256WithEcdsa => "SHA256withECDSA",
        }
    }
}

impl FromStr for SignatureAlgo {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECDSA" => Ok(Self::Ecdsa),
            "SHA256withECDSA" => Ok(Self::Sha256WithEcdsa),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// secp256k1 private key.
#[derive(Clone)]
pub struct SigningKey(k256::ecdsa::SigningKey);

/// secp256k1 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyingKey(k256::ecdsa::VerifyingKey);

impl SigningKey {
    pub fn generate() -> Self {
        Self(k256::ecdsa::SigningKey::random(&mut rand::thread_rng()))
    }

    /// Decode `base64:PKCS#8:<der>`.
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let der = decode_key(encoded, FORMAT_PKCS8)?;
        k256::ecdsa::SigningKey::from_pkcs8_der(&der)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn to_encoded(&self) -> Result<String, CryptoError> {
        let doc = self
            .0
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(encode_key(FORMAT_PKCS8, doc.as_bytes()))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(*self.0.verifying_key())
    }

    /// Raw DER signature bytes.
    pub fn sign_bytes(&self, msg: &[u8], algo: SignatureAlgo) -> Result<Vec<u8>, CryptoError> {
        let sig: Signature = match algo {
            SignatureAlgo::Ecdsa => self
                .0
                .sign_prehash(msg)
                .map_err(|e| CryptoError::Signing(e.to_string()))?,
            SignatureAlgo::Sha256WithEcdsa => self
                .0
                .try_sign(msg)
                .map_err(|e| CryptoError::Signing(e.to_string()))?,
        };
        Ok(sig.to_der().as_bytes().to_vec())
    }

    /// Signature string `<algo>:base64:<der>`.
    pub fn sign(&self, msg: &[u8], algo: SignatureAlgo) -> Result<String, CryptoError> {
        let der = self.sign_bytes(msg, algo)?;
        Ok(format!(
            "{}:{}:{}",
            algo.as_str(),
            KEY_BASE64,
            general_purpose::STANDARD.encode(der)
        ))
    }
}

impl VerifyingKey {
    /// Decode `base64:X.509:<der>`.
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let der = decode_key(encoded, FORMAT_X509)?;
        k256::ecdsa::VerifyingKey::from_public_key_der(&der)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn to_encoded(&self) -> Result<String, CryptoError> {
        let doc = self
            .0
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(encode_key(FORMAT_X509, doc.as_bytes()))
    }

    /// Verify a `<algo>:base64:<der>` signature string.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match.
    /// Malformed strings and unknown algorithms are errors.
    pub fn verify(&self, msg: &[u8], signature: &str) -> Result<bool, CryptoError> {
        let (algo, rest) = signature
            .split_once(':')
            .ok_or_else(|| CryptoError::InvalidSignatureFormat(signature.to_string()))?;
        let algo: SignatureAlgo = algo.parse()?;
        let der = decode_signature(rest)?;
        self.verify_bytes(msg, algo, &der)
    }

    pub fn verify_bytes(
        &self,
        msg: &[u8],
        algo: SignatureAlgo,
        der: &[u8],
    ) -> Result<bool, CryptoError> {
        let Ok(sig) = Signature::from_der(der) else {
            return Ok(false);
        };
        let sig = sig.normalize_s().unwrap_or(sig);
        let ok = match algo {
            SignatureAlgo::Ecdsa => self.0.verify_prehash(msg, &sig).is_ok(),
            SignatureAlgo::Sha256WithEcdsa => self.0.verify(msg, &sig).is_ok(),
        };
        Ok(ok)
    }
}

/// Private key with its public half.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::generate())
    }

    pub fn from_signing(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Load a key pair from its encoded halves. When the public key is
    /// given it must match the private key.
    pub fn from_encoded(
        algo: &str,
        private_key: &str,
        public_key: Option<&str>,
    ) -> Result<Self, CryptoError> {
        if algo != ALGO_EC {
            return Err(CryptoError::UnsupportedAlgorithm(algo.to_string()));
        }
        let pair = Self::from_signing(SigningKey::from_encoded(private_key)?);
        if let Some(pk) = public_key {
            if VerifyingKey::from_encoded(pk)? != pair.verifying {
                return Err(CryptoError::KeyMismatch);
            }
        }
        Ok(pair)
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    pub fn sign(&self, msg: &[u8], algo: SignatureAlgo) -> Result<String, CryptoError> {
        self.signing.sign(msg, algo)
    }
}

/// Decode the bytes of a signature string: everything after `base64:`.
pub fn decode_signature(signature: &str) -> Result<Vec<u8>, CryptoError> {
    let marker = format!("{KEY_BASE64}:");
    let pos = signature
        .find(&marker)
        .ok_or_else(|| CryptoError::InvalidSignatureFormat(signature.to_string()))?;
    general_purpose::STANDARD
        .decode(&signature[pos + marker.len()..])
        .map_err(|_| CryptoError::InvalidSignatureFormat(signature.to_string()))
}

fn encode_key(format: &str, der: &[u8]) -> String {
    format!(
        "{}:{}:{}",
        KEY_BASE64,
        format,
        general_purpose::STANDARD.encode(der)
    )
}

fn decode_key(encoded: &str, expected_format: &str) -> Result<Vec<u8>, CryptoError> {
    let invalid = || CryptoError::InvalidKey("key doesn't contain algorithm of hashing".into());
    let rest = encoded
        .strip_prefix(KEY_BASE64)
        .and_then(|r| r.strip_prefix(':'))
        .ok_or_else(invalid)?;
    let (format, data) = rest.split_once(':').ok_or_else(invalid)?;
    if format != expected_format {
        return Err(CryptoError::InvalidKey(format!(
            "expected {expected_format} key, got {format}"
        )));
    }
    general_purpose::STANDARD
        .decode(data)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey(<redacted>)")
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VerifyingKey({})",
            hex::encode(self.0.to_encoded_point(true).as_bytes())
        )
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("verifying", &self.verifying)
            .finish_non_exhaustive()
    }
}

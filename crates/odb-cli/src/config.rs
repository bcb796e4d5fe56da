use std::fs;
use std::path::Path;

use anyhow::Context;
use odb_chain::ChainConfig;
use odb_crypto::signer::ALGO_EC;
use odb_crypto::KeyPair;
use odb_rules::RulesConfig;
use serde::{Deserialize, Serialize};

/// Settings of a node: consensus limits, layering policy and the user that
/// signs the blocks this node creates.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub rules: RulesConfig,
    pub chain: ChainConfig,
    pub server_user: Option<String>,
    /// Encoded private key of `server_user` (`base64:PKCS#8:...`).
    pub server_private_key: Option<String>,
}

impl NodeConfig {
    /// Load from a TOML file. No path, or a path that does not exist,
    /// gives the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file missing, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Block signer, when both the user and the key are configured.
    pub fn signer(&self) -> anyhow::Result<Option<(String, KeyPair)>> {
        match (&self.server_user, &self.server_private_key) {
            (Some(user), Some(key)) => {
                let pair = KeyPair::from_encoded(ALGO_EC, key, None)
                    .context("decoding server_private_key")?;
                Ok(Some((user.clone(), pair)))
            }
            _ => Ok(None),
        }
    }
}

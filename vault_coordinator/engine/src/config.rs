//! Deployment configuration: node identities, client credential paths, player
//! keys, protocol parameters and blockchain service settings.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::channel::NodeIdentity;
use crate::error::{CoordinatorError, Result};
use crate::types::NodeIndex;

pub const SUPPORTED_CURVE: &str = "secp256k1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub index: u32,
    pub url: String,
    pub server_public_key_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub api_base: String,
    pub protocol: String,
    pub network: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            api_base: "https://svc.blockdaemon.com".into(),
            protocol: "ethereum".into(),
            network: "sepolia".into(),
            api_key_env: "ACCESS_TOKEN".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub nodes: Vec<NodeConfig>,
    pub client_credential: CredentialConfig,
    /// Base64 DER public encryption key of each player, by node index.
    pub player_public_keys: BTreeMap<u32, String>,
    pub threshold: u32,
    pub curve: String,
    #[serde(default)]
    pub key_label: String,
    #[serde(default)]
    pub chain: ChainConfig,
}

const SANDBOX_SERVER_KEYS: [&str; 3] = [
    "-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEaWLFxRxgLQHJ662gcd2LfPFYKDmI\n8AlzFUu/MFR0Pb5d0JYSBL/HAUR5/1OXfEV18riJZJCeOa1gxNocwzqZ9Q==\n-----END PUBLIC KEY-----\n",
    "-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAErPzIZwRgiFpBgIDYCzfRxEgvasus\nHa4qlwWnJ0TnlGgjcfD5Bp40J9HnOdlBkzhtVWq5PiLEMaFWdApTkRBT9Q==\n-----END PUBLIC KEY-----\n",
    "-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEyaLwUY4A99EDvqGMjBT2Q/M3zydm\nOniFOZicnwdvnJTMgXw8LAqLee+0VFIUZbxRPTvN1c1ORoD8+2xJ0VPglg==\n-----END PUBLIC KEY-----\n",
];

const SANDBOX_PLAYER_KEYS: [&str; 3] = [
    "MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEtDFBfanInAMHNKKDG2RW/DiSnYeI7scVvfHIwUIRdbPH0gBrsilqxlvsKZTakN8om/Psc6igO+224X8T0J9eMg==",
    "MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEqvSkhonTeNhlETse8v3X7g4p100EW9xIqg4aRpD8yDXgB0UYjhd+gFtOCsRT2lRhuqNForqqC+YnBsJeZ4ANxg==",
    "MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEBaHCIiViexaVaPuER4tE6oJE3IBA0U//GlB51C1kXkT07liVc51uWuYk78wi4e1unxC95QbeIfnDCG2i43fW3g==",
];

impl CoordinatorConfig {
    /// The three-node sandbox deployment.
    pub fn sandbox() -> Self {
        let nodes = SANDBOX_SERVER_KEYS
            .iter()
            .enumerate()
            .map(|(i, pem)| NodeConfig {
                index: i as u32,
                url: format!("https://tsm-sandbox.prd.wallet.blockdaemon.app:{}", 8080 + i),
                server_public_key_pem: pem.to_string(),
            })
            .collect();
        let player_public_keys = SANDBOX_PLAYER_KEYS
            .iter()
            .enumerate()
            .map(|(i, key)| (i as u32, key.to_string()))
            .collect();

        CoordinatorConfig {
            nodes,
            client_credential: CredentialConfig {
                cert_path: PathBuf::from("./client.crt"),
                key_path: PathBuf::from("./client.key"),
            },
            player_public_keys,
            threshold: 1,
            curve: SUPPORTED_CURVE.into(),
            key_label: String::new(),
            chain: ChainConfig::default(),
        }
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: CoordinatorConfig = serde_json::from_str(&raw).map_err(|e| {
            CoordinatorError::Config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), nodes = config.nodes.len(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let config_error = |msg: String| Err(CoordinatorError::Config(msg));

        if self.nodes.is_empty() {
            return config_error("no nodes configured".into());
        }
        let indices: BTreeSet<u32> = self.nodes.iter().map(|n| n.index).collect();
        if indices.len() != self.nodes.len() {
            return config_error("duplicate node index".into());
        }
        if indices.iter().copied().ne(0..self.node_count()) {
            return config_error(format!(
                "node indices must be 0..{}, got {indices:?}",
                self.node_count()
            ));
        }
        if self.threshold == 0 || self.threshold > self.node_count() {
            return config_error(format!(
                "threshold {} must be between 1 and {}",
                self.threshold,
                self.node_count()
            ));
        }
        if self.curve != SUPPORTED_CURVE {
            return config_error(format!("unsupported curve '{}'", self.curve));
        }
        for index in &indices {
            let Some(key) = self.player_public_keys.get(index) else {
                return config_error(format!("no player public key for node {index}"));
            };
            if STANDARD.decode(key).map_or(true, |der| der.is_empty()) {
                return config_error(format!("player public key for node {index} is not base64"));
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn node_identities(&self) -> Vec<NodeIdentity> {
        self.nodes
            .iter()
            .map(|n| NodeIdentity {
                index: NodeIndex(n.index),
                url: n.url.clone(),
                server_public_key_pem: n.server_public_key_pem.clone(),
            })
            .collect()
    }

    /// Decoded player keys. Entries that fail to decode are skipped; `validate`
    /// reports them.
    pub fn player_keys(&self) -> BTreeMap<NodeIndex, Vec<u8>> {
        self.player_public_keys
            .iter()
            .filter_map(|(index, key)| Some((NodeIndex(*index), STANDARD.decode(key).ok()?)))
            .collect()
    }
}

//! Typed node configuration, loaded from a JSON file.
//!
//! Every recognized option is a field; unknown keys in the file are
//! rejected so typos fail loudly at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use prisma_core::constants::{DEFAULT_PEER_TIMEOUT_SECS, DEFAULT_ZLIB_LEVEL};
use prisma_core::error::PrismaError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub network: NetworkSection,
    pub api: ApiSection,
    pub general: GeneralSection,
    pub developer: DeveloperSection,
    pub bootstrap: BootstrapSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkSection {
    pub listen_port: u16,
    /// Seconds between get_peers rounds.
    pub get_peers_timer: u64,
    /// Seconds between get_events rounds.
    pub get_events_timer: u64,
    /// Per-exchange deadline, seconds.
    pub timeout: u64,
    pub zlib_level: u32,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_port: 19840,
            get_peers_timer: 60,
            get_events_timer: 5,
            timeout: DEFAULT_PEER_TIMEOUT_SECS,
            zlib_level: DEFAULT_ZLIB_LEVEL,
        }
    }
}

/// The admin API is served by external tooling; the port is carried here so
/// one file configures the whole deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApiSection {
    pub listen_port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self { listen_port: 19841 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeneralSection {
    /// Directory of the persistent store.
    pub database: String,
    pub network: ChainNetwork,
    /// Wallet to unlock at startup; empty means the default keyfile.
    pub wallet_address: String,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            database: "~/.prisma/db".into(),
            network: ChainNetwork::Mainnet,
            wallet_address: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainNetwork {
    Mainnet,
    Testnet,
}

impl ChainNetwork {
    pub fn genesis_file_name(self) -> &'static str {
        match self {
            ChainNetwork::Mainnet => "genesis.json",
            ChainNetwork::Testnet => "genesis-testnet.json",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeveloperSection {
    /// Relaxes peer-count and private-IP restrictions for local clusters.
    pub developer_mode: bool,
    /// Non-interactive wallet unlock; external keystore tooling uses it.
    pub wallet_password: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BootstrapSection {
    /// "host:port" entries contacted at startup.
    pub bootstrap_nodes: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, PrismaError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PrismaError::Keystore(format!("read config {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| PrismaError::Keystore(format!("parse config {}: {e}", path.display())))
    }

    /// Load the file when present, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, PrismaError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

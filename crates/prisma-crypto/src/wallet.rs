//! Plain-JSON wallet keyfile.
//!
//! Password-based keystore encryption is handled by the wallet tooling
//! outside this repository; the node only needs a seed to sign with and a
//! stable public identifier.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use prisma_core::error::PrismaError;
use prisma_core::types::{Address, VerifyKeyHex};

use crate::keypair::KeyPair;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletKeys {
    #[serde(rename = "privateKeySeed")]
    pub private_key_seed: String,
    #[serde(rename = "publicKey")]
    pub public_key: VerifyKeyHex,
    pub address: Address,
}

impl WalletKeys {
    /// Create a fresh wallet.
    pub fn create() -> Result<Self, PrismaError> {
        let kp = KeyPair::generate();
        Ok(Self {
            private_key_seed: kp.seed_hex().to_string(),
            public_key: kp.verify_key_hex().clone(),
            address: kp.address()?,
        })
    }

    /// Load a wallet from a keyfile.
    pub fn load(path: &Path) -> Result<Self, PrismaError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PrismaError::Keystore(format!("read {}: {e}", path.display())))?;
        let keys: WalletKeys = serde_json::from_str(&raw)
            .map_err(|e| PrismaError::Keystore(format!("parse {}: {e}", path.display())))?;
        keys.keypair()?; // seed must restore a usable key
        Ok(keys)
    }

    /// Load an existing keyfile, or create and persist a new wallet.
    pub fn load_or_create(path: &Path) -> Result<Self, PrismaError> {
        if path.exists() {
            return Self::load(path);
        }
        let keys = Self::create()?;
        keys.save(path)?;
        info!(address = %keys.address, "created new wallet keyfile");
        Ok(keys)
    }

    pub fn save(&self, path: &Path) -> Result<(), PrismaError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| PrismaError::Keystore(format!("mkdir {}: {e}", dir.display())))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PrismaError::Serialization(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| PrismaError::Keystore(format!("write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Rebuild the signing keypair from the stored seed.
    pub fn keypair(&self) -> Result<KeyPair, PrismaError> {
        let kp = KeyPair::from_seed_hex(&self.private_key_seed)?;
        if kp.verify_key_hex() != &self.public_key {
            return Err(PrismaError::Keystore(
                "public key does not match seed".into(),
            ));
        }
        Ok(kp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_load_round_trip() {
        let dir = std::env::temp_dir().join("prisma_wallet_test_roundtrip");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("keys.json");

        let created = WalletKeys::load_or_create(&path).unwrap();
        let loaded = WalletKeys::load_or_create(&path).unwrap();
        assert_eq!(created.public_key, loaded.public_key);
        assert_eq!(created.address, loaded.address);
        assert!(created.address.ends_with("PR"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mismatched_public_key_is_rejected() {
        let mut keys = WalletKeys::create().unwrap();
        keys.public_key = "0".repeat(64);
        assert!(keys.keypair().is_err());
    }
}

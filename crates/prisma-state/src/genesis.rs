//! Genesis state loading.
//!
//! A network is born from a JSON file of the form
//! `{"state": {"balance": {address: amount}}, "round": -1, "hash": …,
//! "signed": true}`. The hash covers `{"balance": …}` with the balance map
//! sorted by address.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use prisma_core::constants::GENESIS_ROUND;
use prisma_core::error::PrismaError;
use prisma_core::types::{Address, Amount, Round};
use prisma_crypto::hash::hash_event;
use prisma_store::{State, StoreDb, StoredState};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisFile {
    pub state: GenesisState,
    pub round: Round,
    pub hash: String,
    pub signed: bool,
}

/// The hashed portion of the genesis document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisState {
    pub balance: BTreeMap<Address, Amount>,
}

/// Hash of the genesis balances: BLAKE2b over `{"balance": sorted map}`.
pub fn genesis_hash(balance: &BTreeMap<Address, Amount>) -> Result<String, PrismaError> {
    let body = GenesisState { balance: balance.clone() };
    let bytes =
        serde_json::to_vec(&body).map_err(|e| PrismaError::Serialization(e.to_string()))?;
    Ok(hash_event(&bytes))
}

pub fn read_genesis_file(path: &Path) -> Result<GenesisFile, PrismaError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PrismaError::Genesis(format!("read {}: {e}", path.display())))?;
    let genesis: GenesisFile = serde_json::from_str(&raw)
        .map_err(|e| PrismaError::Genesis(format!("parse {}: {e}", path.display())))?;
    let expected = genesis_hash(&genesis.state.balance)?;
    if genesis.hash != expected {
        return Err(PrismaError::Genesis(format!(
            "genesis hash mismatch: file says {}, balances hash to {expected}",
            genesis.hash
        )));
    }
    if genesis.round != GENESIS_ROUND {
        return Err(PrismaError::Genesis(format!(
            "genesis round must be {GENESIS_ROUND}, got {}",
            genesis.round
        )));
    }
    Ok(genesis)
}

/// Install the genesis state unless some state already exists.
pub fn sync_genesis(store: &StoreDb, path: &Path) -> Result<(), PrismaError> {
    if store.get_state(GENESIS_ROUND)?.is_some() || store.get_last_state()?.is_some() {
        return Ok(());
    }
    let genesis = read_genesis_file(path)?;
    install_genesis(store, genesis.state.balance)?;
    Ok(())
}

/// Write a genesis state directly from a balance map (used by tests and by
/// `sync_genesis`).
pub fn install_genesis(
    store: &StoreDb,
    balance: BTreeMap<Address, Amount>,
) -> Result<String, PrismaError> {
    let hash = genesis_hash(&balance)?;
    store.insert_state(&StoredState {
        state: State {
            last_round: GENESIS_ROUND,
            prev_hash: String::new(),
            balance,
        },
        hash: hash.clone(),
        signed: true,
    })?;
    info!(hash = %hash, "genesis state installed");
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> StoreDb {
        let dir = std::env::temp_dir().join(format!("prisma_genesis_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        StoreDb::open(&dir).unwrap()
    }

    fn fixture_balances() -> BTreeMap<Address, Amount> {
        let mut balance = BTreeMap::new();
        balance.insert("3918807197700602162PR".to_string(), 100_000);
        balance.insert("3558462963507083618PR".to_string(), 100_000);
        balance.insert("7306589250910697267PR".to_string(), 300_000);
        balance
    }

    #[test]
    fn genesis_load_sets_balances_and_flags() {
        let store = temp_store("load");
        install_genesis(&store, fixture_balances()).unwrap();

        let stored = store.get_state(GENESIS_ROUND).unwrap().unwrap();
        assert!(stored.signed);
        assert_eq!(stored.state.last_round, -1);
        assert_eq!(stored.hash, genesis_hash(&fixture_balances()).unwrap());
        assert_eq!(
            store.get_account_balance("7306589250910697267PR", None).unwrap(),
            300_000
        );
    }

    #[test]
    fn genesis_file_round_trip() {
        let dir = std::env::temp_dir().join("prisma_genesis_test_file");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("genesis.json");

        let balance = fixture_balances();
        let genesis = GenesisFile {
            state: GenesisState { balance: balance.clone() },
            round: -1,
            hash: genesis_hash(&balance).unwrap(),
            signed: true,
        };
        std::fs::write(&path, serde_json::to_string(&genesis).unwrap()).unwrap();

        let store = temp_store("file");
        sync_genesis(&store, &path).unwrap();
        assert!(store.get_state(-1).unwrap().is_some());

        // Already present: loading again changes nothing.
        sync_genesis(&store, &path).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupted_genesis_hash_rejected() {
        let dir = std::env::temp_dir().join("prisma_genesis_test_bad");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("genesis.json");

        let balance = fixture_balances();
        let genesis = GenesisFile {
            state: GenesisState { balance },
            round: -1,
            hash: "00".repeat(32),
            signed: true,
        };
        std::fs::write(&path, serde_json::to_string(&genesis).unwrap()).unwrap();
        assert!(read_genesis_file(&path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use prisma_core::error::PrismaError;
use prisma_core::types::{Address, Amount, EventId, Round, Timestamp, VerifyKeyHex};

// ── Peers ────────────────────────────────────────────────────────────────────

/// A known peer, as stored and as exchanged in `get_peers` responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Creation time of the newest event the peer reported.
    pub latest_event: Timestamp,
    /// When we last heard from this peer (Unix seconds).
    pub seen: i64,
}

// ── Transactions ─────────────────────────────────────────────────────────────

/// A transaction in the local log.
///
/// Lifecycle: pooled (no `event_hash`) → embedded (`event_hash` set) →
/// ordered (`round` set) → absorbed into a signed state and deleted.
/// State-signature transactions only pass through the pool; balance queries
/// ignore them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx_type: i64,
    pub amount: Amount,
    pub sender_id: Address,
    pub recipient_id: Address,
    pub timestamp: i64,
    /// The hex payload exactly as it is embedded into events.
    pub tx_dict_hex: String,
    pub event_hash: Option<EventId>,
    pub round: Option<Round>,
}

// ── States ───────────────────────────────────────────────────────────────────

/// A balance snapshot at a consensus boundary.
///
/// The canonical JSON — `{"_id": …, "prev_hash": …, "balance": {…}}` with the
/// balance map sorted by address — is what gets hashed and signed, so the
/// field order here is fixed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "_id")]
    pub last_round: Round,
    pub prev_hash: String,
    pub balance: BTreeMap<Address, Amount>,
}

impl State {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PrismaError> {
        serde_json::to_vec(self).map_err(|e| PrismaError::Serialization(e.to_string()))
    }
}

/// A state plus its local bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub state: State,
    pub hash: String,
    pub signed: bool,
}

// ── State signatures ─────────────────────────────────────────────────────────

/// One collected signature: the signer's verify key and the attached blob
/// over `{"last_round": …, "hash": …}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub verify_key: VerifyKeyHex,
    pub signed: String,
}

/// Signature bookkeeping for one checkpoint round.
///
/// Remote signatures arrive before the local state may exist and are parked
/// in `unchecked_pair` as (claimed hash, signature) until the local hash is
/// available for comparison.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSignatures {
    pub hash: Option<String>,
    pub sign: Vec<SignatureEntry>,
    pub unchecked_pair: Vec<(String, SignatureEntry)>,
}

impl StateSignatures {
    pub fn has_signer(&self, verify_key: &str) -> bool {
        self.sign.iter().any(|s| s.verify_key == verify_key)
    }
}

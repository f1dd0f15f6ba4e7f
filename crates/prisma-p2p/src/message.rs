use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use prisma_core::error::PrismaError;
use prisma_core::types::{EventId, Height, Round, Timestamp, VerifyKeyHex};
use prisma_crypto::keypair::SignedData;
use prisma_store::{PeerInfo, State};

/// An attached-signature envelope as it travels on the wire: the verify key
/// and the signed blob (the detached form stays local).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub verify_key: VerifyKeyHex,
    pub signed: String,
}

impl From<SignedData> for SignedPayload {
    fn from(data: SignedData) -> Self {
        SignedPayload { verify_key: data.verify_key, signed: data.signed }
    }
}

impl From<SignedPayload> for SignedData {
    fn from(payload: SignedPayload) -> Self {
        SignedData {
            signed: payload.signed,
            sig_detached: String::new(),
            verify_key: payload.verify_key,
        }
    }
}

/// One link of the signed-state chain: a state and its proofs
/// (verify key → attached signature over `{last_round, hash}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateUnit {
    pub state: State,
    pub signatures: BTreeMap<VerifyKeyHex, String>,
}

/// Bootstrap tables a cold-starting node needs next to the state chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartData {
    pub rounds: BTreeMap<EventId, Round>,
    pub witnesses: BTreeMap<Round, BTreeMap<VerifyKeyHex, EventId>>,
    pub heights: BTreeMap<EventId, Height>,
}

/// The six messages of the sync protocol, tagged by `method`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireMessage {
    #[serde(rename = "get_peers")]
    GetPeers {
        #[serde(rename = "_id")]
        id: String,
        port: u16,
        latest_event: Timestamp,
    },
    #[serde(rename = "get_peers_response")]
    GetPeersResponse { peers: Vec<PeerInfo> },
    #[serde(rename = "get_events")]
    GetEvents {
        latest_event: Timestamp,
        event_info: SignedPayload,
    },
    #[serde(rename = "get_events_response")]
    GetEventsResponse { events: Option<SignedPayload> },
    #[serde(rename = "get_state")]
    GetState { last_round: Round },
    #[serde(rename = "get_state_response")]
    GetStateResponse {
        states: Option<Vec<StateUnit>>,
        start_data: Option<StartData>,
    },
}

const VALID_METHODS: [&str; 6] = [
    "get_peers",
    "get_peers_response",
    "get_events",
    "get_events_response",
    "get_state",
    "get_state_response",
];

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PrismaError> {
        serde_json::to_vec(self).map_err(|e| PrismaError::Serialization(e.to_string()))
    }

    /// Decode a frame. An unrecognized `method` is reported distinctly from
    /// a malformed body so the peer handler can log it as such.
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, PrismaError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| PrismaError::Peer(format!("malformed message: {e}")))?;
        match value.get("method").and_then(|m| m.as_str()) {
            Some(method) if VALID_METHODS.contains(&method) => {}
            _ => return Err(PrismaError::UnknownMethod),
        }
        serde_json::from_value(value).map_err(|e| PrismaError::Peer(format!("bad payload: {e}")))
    }
}

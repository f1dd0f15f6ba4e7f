use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PrismaError;
use crate::types::{EventId, Timestamp, VerifyKeyHex};

/// A vertex of the hashgraph.
///
/// The field names follow the wire tuple order:
///
/// * `d` — payload: hex-encoded transactions, creator order preserved
/// * `p` — parent event ids: empty for a root, exactly two otherwise
///   (self-parent first, other-parent second)
/// * `t` — creation time, seconds
/// * `c` — creator verify key
/// * `s` — detached Ed25519 signature over the serialized `(d, p, t, c)`
///
/// The canonical form is the JSON array `[d, p, t, c, s]`; its BLAKE2b hash
/// is the event id. Field order is fixed — reordering changes every hash in
/// the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub d: Vec<String>,
    pub p: Vec<EventId>,
    pub t: Timestamp,
    pub c: VerifyKeyHex,
    pub s: String,
}

impl Event {
    /// A root event has no parents and anchors its creator's chain.
    pub fn is_root(&self) -> bool {
        self.p.is_empty()
    }

    pub fn self_parent(&self) -> Option<&EventId> {
        self.p.first()
    }

    pub fn other_parent(&self) -> Option<&EventId> {
        self.p.get(1)
    }

    /// Bytes signed by the creator: JSON of the 4-tuple `(d, p, t, c)`.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, PrismaError> {
        serde_json::to_vec(&(&self.d, &self.p, self.t, &self.c))
            .map_err(|e| PrismaError::Serialization(e.to_string()))
    }

    /// Bytes hashed into the event id: JSON of the full 5-tuple.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PrismaError> {
        serde_json::to_vec(&(&self.d, &self.p, self.t, &self.c, &self.s))
            .map_err(|e| PrismaError::Serialization(e.to_string()))
    }
}

// Events travel as plain 5-element arrays, never as JSON objects.
impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.d, &self.p, self.t, &self.c, &self.s).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (d, p, t, c, s) =
            <(Vec<String>, Vec<EventId>, Timestamp, VerifyKeyHex, String)>::deserialize(
                deserializer,
            )?;
        if !p.is_empty() && p.len() != 2 {
            return Err(D::Error::custom("event must have zero or two parents"));
        }
        Ok(Event { d, p, t, c, s })
    }
}

use serde::{Deserialize, Serialize};

use crate::constants::{ADDRESS_SUFFIX, VERIFY_KEY_HEX_LEN};
use crate::error::PrismaError;
use crate::types::{Address, Amount, Round, VerifyKeyHex};

/// Money transfer between two wallets.
pub const TX_TYPE_TRANSFER: i64 = 0;
/// A node's signature over a balance checkpoint.
pub const TX_TYPE_SIGNED_STATE: i64 = 1;

// ── Payloads ─────────────────────────────────────────────────────────────────

/// A money transfer as embedded in event payloads (hex-encoded JSON).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferTx {
    #[serde(rename = "type")]
    pub tx_type: i64,
    pub amount: Amount,
    #[serde(rename = "senderPublicKey")]
    pub sender_public_key: VerifyKeyHex,
    #[serde(rename = "senderId")]
    pub sender_id: Address,
    #[serde(rename = "recipientId")]
    pub recipient_id: Address,
    pub timestamp: i64,
}

/// A state-signature transaction: an attached Ed25519 signature whose blob
/// contains the JSON body `{"last_round": …, "hash": …}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSignatureTx {
    #[serde(rename = "type")]
    pub tx_type: i64,
    pub verify_key: VerifyKeyHex,
    pub signed: String,
}

/// Message carried inside a state-signature blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSignBody {
    pub last_round: Round,
    pub hash: String,
}

/// Any transaction a payload entry can decode to.
#[derive(Clone, Debug, PartialEq)]
pub enum TxPayload {
    Transfer(TransferTx),
    StateSignature(StateSignatureTx),
}

impl TxPayload {
    /// Decode a hex-encoded JSON transaction, dispatching on the `type` field.
    pub fn from_hex(tx_hex: &str) -> Result<TxPayload, PrismaError> {
        let raw = hex::decode(tx_hex)
            .map_err(|e| PrismaError::MalformedTransaction(format!("hex: {e}")))?;
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| PrismaError::MalformedTransaction(format!("json: {e}")))?;

        // Some encoders emit the type as an integer, others as a decimal
        // string; accept either.
        let tx_type = match value.get("type") {
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| PrismaError::MalformedTransaction("type".into()))?,
            Some(serde_json::Value::String(s)) => s
                .parse::<i64>()
                .map_err(|_| PrismaError::MalformedTransaction("type".into()))?,
            _ => return Err(PrismaError::MalformedTransaction("missing type".into())),
        };

        match tx_type {
            TX_TYPE_TRANSFER => {
                let mut tx: TransferTx = serde_json::from_value(normalize_type(value))
                    .map_err(|e| PrismaError::MalformedTransaction(e.to_string()))?;
                tx.tx_type = TX_TYPE_TRANSFER;
                validate_transfer(&tx)?;
                Ok(TxPayload::Transfer(tx))
            }
            TX_TYPE_SIGNED_STATE => {
                let mut tx: StateSignatureTx = serde_json::from_value(normalize_type(value))
                    .map_err(|e| PrismaError::MalformedTransaction(e.to_string()))?;
                tx.tx_type = TX_TYPE_SIGNED_STATE;
                Ok(TxPayload::StateSignature(tx))
            }
            other => Err(PrismaError::UnknownTxType(other)),
        }
    }

    /// Hex-encode the JSON form, the shape carried in event payloads.
    pub fn to_hex(&self) -> Result<String, PrismaError> {
        let json = match self {
            TxPayload::Transfer(tx) => serde_json::to_vec(tx),
            TxPayload::StateSignature(tx) => serde_json::to_vec(tx),
        }
        .map_err(|e| PrismaError::Serialization(e.to_string()))?;
        Ok(hex::encode(json))
    }
}

fn normalize_type(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(t) = value.get_mut("type") {
        if let Some(s) = t.as_str() {
            if let Ok(n) = s.parse::<i64>() {
                *t = serde_json::Value::from(n);
            }
        }
    }
    value
}

// ── Syntactic validation ─────────────────────────────────────────────────────

/// A wallet address is a decimal u64 followed by the `PR` suffix.
pub fn validate_address(address: &str) -> Result<(), PrismaError> {
    let digits = address
        .strip_suffix(ADDRESS_SUFFIX)
        .ok_or_else(|| PrismaError::MalformedAddress(address.to_string()))?;
    if digits.is_empty() || digits.parse::<u64>().is_err() {
        return Err(PrismaError::MalformedAddress(address.to_string()));
    }
    Ok(())
}

pub fn validate_amount(amount: Amount) -> Result<(), PrismaError> {
    if amount < 1 {
        return Err(PrismaError::InvalidAmount);
    }
    Ok(())
}

pub fn validate_public_key(pk_hex: &str) -> Result<(), PrismaError> {
    if pk_hex.len() != VERIFY_KEY_HEX_LEN || hex::decode(pk_hex).is_err() {
        return Err(PrismaError::InvalidPublicKey);
    }
    Ok(())
}

pub fn validate_transfer(tx: &TransferTx) -> Result<(), PrismaError> {
    validate_address(&tx.sender_id)?;
    validate_address(&tx.recipient_id)?;
    validate_amount(tx.amount)?;
    validate_public_key(&tx.sender_public_key)?;
    if tx.tx_type != TX_TYPE_TRANSFER {
        return Err(PrismaError::UnknownTxType(tx.tx_type));
    }
    Ok(())
}

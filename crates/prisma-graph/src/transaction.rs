use tracing::{debug, warn};

use prisma_core::error::PrismaError;
use prisma_core::transaction::{
    validate_transfer, StateSignatureTx, TransferTx, TxPayload, TX_TYPE_TRANSFER,
};
use prisma_core::types::{Address, Amount, EventId, Round, VerifyKeyHex};
use prisma_store::{StoreDb, StoredTransaction};

use crate::graph::Graph;

/// Build a hex-encoded money transfer from the local wallet.
pub fn form_funds_tx(
    sender_public_key: &VerifyKeyHex,
    sender_id: &Address,
    recipient_id: &Address,
    amount: Amount,
) -> Result<String, PrismaError> {
    let tx = TransferTx {
        tx_type: TX_TYPE_TRANSFER,
        amount,
        sender_public_key: sender_public_key.clone(),
        sender_id: sender_id.clone(),
        recipient_id: recipient_id.clone(),
        timestamp: chrono::Utc::now().timestamp(),
    };
    validate_transfer(&tx)?;
    TxPayload::Transfer(tx).to_hex()
}

/// Parse a payload entry and enforce the sender-balance precondition for
/// transfers. Equality passes: a wallet may be emptied to exactly zero.
pub fn parse_with_balance_check(
    store: &StoreDb,
    tx_hex: &str,
    bypass_balance: bool,
) -> Result<TxPayload, PrismaError> {
    let parsed = TxPayload::from_hex(tx_hex)?;
    if bypass_balance {
        return Ok(parsed);
    }
    if let TxPayload::Transfer(tx) = &parsed {
        let balance = store.get_account_balance(&tx.sender_id, None)?;
        if tx.amount > balance {
            return Err(PrismaError::InsufficientFunds {
                need: tx.amount,
                have: balance,
            });
        }
    }
    Ok(parsed)
}

/// Admit transactions into the local pool. Each is parsed and soft-checked;
/// malformed or unfunded entries are skipped. Pool entries carry no
/// event_hash yet — they are drained into the next local event.
pub fn insert_transactions_into_pool(
    store: &StoreDb,
    tx_hex_list: &[String],
) -> Result<usize, PrismaError> {
    let mut prepared = Vec::new();
    for tx_hex in tx_hex_list {
        match parse_with_balance_check(store, tx_hex, false) {
            Ok(parsed) => prepared.push(pool_record(parsed, tx_hex)),
            Err(e) => {
                warn!(error = %e, "skipping malformed transaction at pool gate");
                continue;
            }
        }
    }
    let admitted = prepared.len();
    store.insert_transactions(&prepared)?;
    Ok(admitted)
}

fn pool_record(parsed: TxPayload, tx_hex: &str) -> StoredTransaction {
    match parsed {
        TxPayload::Transfer(tx) => StoredTransaction {
            tx_type: tx.tx_type,
            amount: tx.amount,
            sender_id: tx.sender_id,
            recipient_id: tx.recipient_id,
            timestamp: tx.timestamp,
            tx_dict_hex: tx_hex.to_string(),
            event_hash: None,
            round: None,
        },
        TxPayload::StateSignature(tx) => StoredTransaction {
            tx_type: tx.tx_type,
            amount: 0,
            sender_id: String::new(),
            recipient_id: String::new(),
            timestamp: 0,
            tx_dict_hex: tx_hex.to_string(),
            event_hash: None,
            round: None,
        },
    }
}

impl Graph {
    /// Absorb a round's final order into the transaction log.
    ///
    /// Remote events are unpacked: transfers are re-checked against the
    /// authoritative balance and appended with their round; state signatures
    /// are handed back to the caller for the checkpoint manager. Payloads of
    /// self-authored events are already pooled locally, so they only get
    /// their round stamped.
    pub(crate) fn insert_processed_transactions(
        &mut self,
        ordered: &[EventId],
        r: Round,
    ) -> Result<Vec<StateSignatureTx>, PrismaError> {
        let mut tx_list = Vec::new();
        let mut signs = Vec::new();

        for event_hash in ordered {
            let Some(event) = self.store.get_event(event_hash)? else {
                warn!(event = %event_hash, "ordered event missing from store");
                continue;
            };
            if event.d.is_empty() {
                continue;
            }

            if &event.c == self.verify_key() {
                self.store.set_transaction_round(event_hash, r)?;
                continue;
            }

            for tx_hex in &event.d {
                match parse_with_balance_check(&self.store, tx_hex, false) {
                    Ok(TxPayload::Transfer(tx)) => {
                        debug!(event = %event_hash, round = r, amount = tx.amount, "ordered transfer");
                        let mut record = pool_record(TxPayload::Transfer(tx), tx_hex);
                        record.event_hash = Some(event_hash.clone());
                        record.round = Some(r);
                        tx_list.push(record);
                    }
                    Ok(TxPayload::StateSignature(tx)) => {
                        debug!(event = %event_hash, "ordered state signature");
                        signs.push(tx);
                    }
                    Err(e) => {
                        warn!(event = %event_hash, error = %e, "dropping transaction at ordering");
                    }
                }
            }
        }

        self.store.insert_transactions(&tx_list)?;
        Ok(signs)
    }
}

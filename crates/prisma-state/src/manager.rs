//! The signed-state manager.
//!
//! Every `to_sign_count` decided consensus rounds, the node folds the ordered
//! transfers into a balance snapshot, signs `(last_round, hash)` and gossips
//! the signature as a type-1 transaction. Once a supermajority of matching
//! signatures is collected the state is final and everything at or below its
//! round is pruned.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use prisma_core::error::PrismaError;
use prisma_core::transaction::{StateSignBody, StateSignatureTx, TxPayload, TX_TYPE_SIGNED_STATE};
use prisma_core::types::{Round, VerifyKeyHex};
use prisma_crypto::hash::{address_from_verify_key, hash_event};
use prisma_crypto::keypair::verify_attached;
use prisma_graph::transaction::insert_transactions_into_pool;
use prisma_graph::Graph;
use prisma_store::{SignatureEntry, State, StoredState};

/// Build and store the (unsigned) state covering `[start_round, last_round]`.
/// The absorbed transfers are dropped; their net effect lives in the state.
pub fn create_state(
    graph: &mut Graph,
    start_round: Round,
    last_round: Round,
) -> Result<String, PrismaError> {
    let prev = graph
        .store
        .get_last_state()?
        .ok_or_else(|| PrismaError::Genesis("no previous state; genesis not loaded".into()))?;

    let balance = graph
        .store
        .get_account_balance_many(Some((start_round, last_round)))?;
    let state = State {
        last_round,
        prev_hash: prev.hash.clone(),
        balance,
    };
    let hash = hash_event(&state.canonical_bytes()?);

    graph.store.delete_money_transfers_lte_round(last_round)?;
    graph.store.insert_state(&StoredState {
        state,
        hash: hash.clone(),
        signed: false,
    })?;
    info!(last_round, hash = %hash, "created state checkpoint");
    Ok(hash)
}

/// Sign the next checkpoint and return it as a hex type-1 transaction.
pub fn create_state_sign(graph: &mut Graph) -> Result<String, PrismaError> {
    let from = graph.store.get_consensus_last_created_sign()?;
    let consensus = graph
        .store
        .get_consensus_greater_than(from, graph.to_sign_count)?;
    if consensus.len() != graph.to_sign_count {
        return Err(PrismaError::NotEnoughRounds {
            have: consensus.len(),
            need: graph.to_sign_count,
        });
    }
    let last_round = consensus[consensus.len() - 1];

    let hash = match graph.store.get_state(last_round)? {
        Some(stored) => stored.hash,
        None => create_state(graph, consensus[0], last_round)?,
    };

    let body = StateSignBody { last_round, hash: hash.clone() };
    let body_json =
        serde_json::to_vec(&body).map_err(|e| PrismaError::Serialization(e.to_string()))?;
    let signed = graph.sign_attached(&body_json);

    let tx = StateSignatureTx {
        tx_type: TX_TYPE_SIGNED_STATE,
        verify_key: signed.verify_key.clone(),
        signed: signed.signed.clone(),
    };
    let tx_hex = TxPayload::StateSignature(tx).to_hex()?;

    graph.store.set_consensus_last_created_sign(last_round)?;
    // Keep our own signature so a cold-starting peer gets a full proof set.
    graph.store.insert_signature(
        last_round,
        &hash,
        SignatureEntry { verify_key: signed.verify_key, signed: signed.signed },
    )?;
    debug!(last_round, "created state signature");
    Ok(tx_hex)
}

/// While enough decided rounds are pending, create state signatures and push
/// them into the outbound pool.
pub fn try_create_state_signatures(graph: &mut Graph) -> Result<(), PrismaError> {
    let mut signatures = Vec::new();
    while graph.unsent_count >= graph.to_sign_count {
        match create_state_sign(graph) {
            Ok(tx_hex) => {
                signatures.push(tx_hex);
                graph.unsent_count -= graph.to_sign_count;
            }
            Err(PrismaError::NotEnoughRounds { have, need }) => {
                debug!(have, need, "not enough decided rounds for a checkpoint");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    if !signatures.is_empty() {
        insert_transactions_into_pool(&graph.store, &signatures)?;
    }
    Ok(())
}

/// Take in a remote state signature from the ordered stream.
///
/// The signature is parked as unchecked, then the local chain advances as
/// far as the collected signatures allow. Idempotent per (signer, round):
/// re-delivery parks a duplicate pair which is discarded at promotion.
pub fn handle_new_sign(graph: &mut Graph, tx: &StateSignatureTx) -> Result<(), PrismaError> {
    let body_bytes = verify_attached(&tx.verify_key, &tx.signed)?;
    let body: StateSignBody = serde_json::from_slice(&body_bytes)
        .map_err(|e| PrismaError::MalformedTransaction(format!("state sign body: {e}")))?;

    if tx.verify_key == *graph.verify_key() {
        return Ok(());
    }
    if body.last_round <= graph.last_signed_state {
        debug!(round = body.last_round, "stale state signature ignored");
        return Ok(());
    }

    graph.store.insert_signature_unchecked(
        body.last_round,
        &body.hash,
        SignatureEntry { verify_key: tx.verify_key.clone(), signed: tx.signed.clone() },
    )?;

    // Advance while whole checkpoint windows are decided and signable.
    loop {
        let local_consensus = graph
            .store
            .get_consensus_greater_than(graph.last_signed_state, graph.to_sign_count)?;
        if local_consensus.len() != graph.to_sign_count
            || !update_state_sign(graph, &local_consensus)?
        {
            break;
        }
    }
    Ok(())
}

/// Compare parked signatures with the local state hash; finalize and prune
/// once a supermajority agrees. Returns whether a state was finalized.
pub fn update_state_sign(graph: &mut Graph, local_consensus: &[Round]) -> Result<bool, PrismaError> {
    let last_round = match local_consensus.last() {
        Some(r) => *r,
        None => return Ok(false),
    };
    let Some(mut signatures) = graph.store.get_signature(last_round)? else {
        debug!(last_round, "no signatures collected yet");
        return Ok(false);
    };

    let local_hash = match graph.store.get_state(last_round)? {
        Some(stored) => stored.hash,
        // Remote signatures can outrun our own checkpoint creation.
        None => create_state(graph, local_consensus[0], last_round)?,
    };

    let mut promoted = 0usize;
    for (remote_hash, entry) in std::mem::take(&mut signatures.unchecked_pair) {
        if remote_hash == local_hash {
            if graph.store.insert_signature(last_round, &local_hash, entry)? {
                promoted += 1;
            }
        } else {
            error!(last_round, %remote_hash, %local_hash, "state hash mismatch from peer");
        }
    }
    graph.store.clear_unchecked_signatures(last_round)?;

    if promoted == 0 {
        return Ok(false);
    }

    let sign_count = graph
        .store
        .get_signature(last_round)?
        .map(|s| s.sign.len())
        .unwrap_or(0);
    if (sign_count as u64) < graph.min_stake {
        debug!(last_round, sign_count, "signatures below supermajority");
        return Ok(false);
    }

    info!(last_round, sign_count, "state finalized by supermajority");
    graph.store.sign_consensus(graph.to_sign_count)?;
    graph.last_signed_state = last_round;
    clean_database(graph, last_round)?;
    graph.store.set_state_signed(last_round)?;
    Ok(true)
}

/// Drop everything the finalized state makes redundant.
///
/// Round and height entries survive as tombstones: validating a late event
/// whose parents were pruned needs the parent round, and the height
/// recurrence must produce identical values on every node even across the
/// prune boundary.
pub fn clean_database(graph: &mut Graph, last_signed: Round) -> Result<(), PrismaError> {
    graph.store.delete_transactions_lte_round(last_signed)?;
    graph.store.delete_witnesses_less_than(last_signed)?;

    let hash_list = graph.store.get_rounds_hash_list(last_signed)?;
    for id in &hash_list {
        graph.store.delete_event(id)?;
        graph.store.delete_can_see(id)?;
        graph.store.delete_votes(id)?;
        graph.store.delete_famous(id)?;
        graph.tbd.remove(id);
    }
    graph.store.delete_references_can_see(&hash_list)?;

    graph.store.delete_signed_states_less_than(last_signed)?;
    graph.store.delete_signatures_less_than(last_signed)?;
    debug!(last_signed, pruned = hash_list.len(), "database cleaned");
    Ok(())
}

/// Validate one received state against the local chain tip and its
/// signature proofs, then store it as signed.
pub fn handle_received_state(
    graph: &mut Graph,
    state: State,
    signatures: &BTreeMap<VerifyKeyHex, String>,
) -> Result<(), PrismaError> {
    let last = graph
        .store
        .get_last_state()?
        .ok_or_else(|| PrismaError::Genesis("no local state to chain from".into()))?;
    if last.hash != state.prev_hash {
        return Err(PrismaError::StateChainBroken(state.last_round));
    }

    let state_hash = hash_event(&state.canonical_bytes()?);

    let mut proof = Vec::new();
    for (verify_key, signed) in signatures {
        let body_bytes = match verify_attached(verify_key, signed) {
            Ok(b) => b,
            Err(e) => {
                warn!(signer = %verify_key, error = %e, "bad state proof signature");
                continue;
            }
        };
        let body: StateSignBody = match serde_json::from_slice(&body_bytes) {
            Ok(b) => b,
            Err(_) => continue,
        };

        // Only funded participants count toward the proof.
        let signer_addr = address_from_verify_key(verify_key)?;
        let funded = graph.store.get_state_balance(&signer_addr)? != 0;

        if funded && body.last_round == state.last_round && body.hash == state_hash {
            proof.push(SignatureEntry {
                verify_key: verify_key.clone(),
                signed: signed.clone(),
            });
        } else {
            warn!(signer = %verify_key, round = state.last_round, "state proof rejected");
        }
    }

    if (proof.len() as u64) < graph.min_stake {
        return Err(PrismaError::NotEnoughSignatures {
            have: proof.len(),
            need: graph.min_stake as usize,
        });
    }

    let last_round = state.last_round;
    graph.store.insert_state(&StoredState {
        state,
        hash: state_hash.clone(),
        signed: true,
    })?;
    for entry in proof {
        graph.store.insert_signature(last_round, &state_hash, entry)?;
    }
    Ok(())
}

/// Validate and store a whole chain of states, oldest first.
pub fn handle_received_state_chain(
    graph: &mut Graph,
    chain: Vec<(State, BTreeMap<VerifyKeyHex, String>)>,
) -> Result<(), PrismaError> {
    for (state, signatures) in chain {
        handle_received_state(graph, state, &signatures)?;
    }
    Ok(())
}

//! One consensus tick.
//!
//! A sync tick is the only place consensus advances: remote events come in,
//! the local chain extends, then divide_rounds → decide_fame → find_order
//! run in that sequence, and any state signatures surfaced by the new total
//! order are fed to the checkpoint manager.

use tracing::{debug, info};

use prisma_core::error::PrismaError;
use prisma_crypto::keypair::SignedData;
use prisma_graph::Graph;

use crate::manager;

/// Outcome of a tick, for logging and tests.
#[derive(Debug, Default, PartialEq)]
pub struct TickOutcome {
    pub inserted_events: usize,
    pub new_consensus_rounds: usize,
}

/// Process a signed `get_events` response end to end.
pub fn process_events_response(
    graph: &mut Graph,
    events_sign: &SignedData,
) -> Result<TickOutcome, PrismaError> {
    let (remote_cg, remote_head) = graph.validate_remote_events(events_sign)?;
    if remote_cg.is_empty() || !remote_cg.contains_key(&remote_head) {
        debug!("nothing new from peer");
        return Ok(TickOutcome::default());
    }

    // Drain the pool into the new event's payload.
    let (pool_ids, payload) = graph.store.get_unsent_transactions(&graph.address)?;

    let Some(new_events) = graph.insert_new_events(&remote_cg, &remote_head, payload)? else {
        return Ok(TickOutcome::default());
    };
    let inserted_events = new_events.len();

    graph.divide_rounds(&new_events)?;

    // The drained transactions now live in our head event.
    if let Some(head) = graph.store.get_head()? {
        graph.store.set_transaction_event_hash(&pool_ids, &head)?;
    }

    let new_c = graph.decide_fame()?;
    let remote_signs = graph.find_order(&new_c)?;
    for sign in &remote_signs {
        manager::handle_new_sign(graph, sign)?;
    }

    graph.unsent_count += new_c.len();
    manager::try_create_state_signatures(graph)?;

    if !new_c.is_empty() {
        info!(rounds = ?new_c, "consensus advanced");
    }
    Ok(TickOutcome {
        inserted_events,
        new_consensus_rounds: new_c.len(),
    })
}

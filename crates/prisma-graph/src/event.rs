use tracing::debug;

use prisma_core::error::PrismaError;
use prisma_core::event::Event;
use prisma_core::types::EventId;
use prisma_crypto::hash::hash_event;
use prisma_crypto::keypair::verify_detached;

use crate::graph::Graph;

impl Graph {
    /// Create and sign a new local event.
    ///
    /// The payload is a list of hex-encoded transactions in submission order;
    /// parents are `(self_head, remote_head)` or empty for a root.
    pub fn new_event(
        &self,
        payload: Vec<String>,
        parents: Vec<EventId>,
    ) -> Result<(EventId, Event), PrismaError> {
        let t = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        let mut ev = Event {
            d: payload,
            p: parents,
            t,
            c: self.verify_key().clone(),
            s: String::new(),
        };
        let signed = self.sign_attached(&ev.signing_bytes()?);
        ev.s = signed.sig_detached;
        let id = hash_event(&ev.canonical_bytes()?);
        debug!(event = %id, payload = ev.d.len(), "created event");
        Ok((id, ev))
    }

    /// Validate an event against signature, hash and parent rules.
    ///
    /// Parents below the signed-state boundary may already be pruned, so a
    /// missing parent is legal when its recorded round is checkpointed — and
    /// when nothing at all is recorded we cannot distinguish "pruned long
    /// ago" from "not yet received": the sender resolves that by resending.
    pub fn is_valid_event(&self, id: &EventId, ev: &Event) -> Result<(), PrismaError> {
        verify_detached(&ev.c, &ev.signing_bytes()?, &ev.s)?;

        if hash_event(&ev.canonical_bytes()?) != *id {
            return Err(PrismaError::HashMismatch(id.clone()));
        }

        if ev.is_root() {
            return Ok(());
        }

        // Checked by the deserializer for wire events; local construction
        // must obey the same shape.
        debug_assert_eq!(ev.p.len(), 2);

        for parent in &ev.p {
            if !self.store.event_exists(parent) {
                let checkpointed = matches!(
                    self.store.get_round(parent)?,
                    Some(r) if r <= self.last_signed_state
                );
                if !checkpointed {
                    return Err(PrismaError::ParentMissing(parent.clone()));
                }
            }
        }

        // Self-parent shares the creator; other-parent must not. Either rule
        // is waived for parents already folded into a signed state.
        let parent_round = |p: &EventId| -> Result<Option<i64>, PrismaError> {
            self.store.get_round(p)
        };
        let waived = |round: Option<i64>| matches!(round, Some(r) if r <= self.last_signed_state);

        let p0 = &ev.p[0];
        if let Some(first) = self.store.get_event(p0)? {
            if first.c != ev.c && !waived(parent_round(p0)?) {
                return Err(PrismaError::SelfParentForked(id.clone()));
            }
        }
        let p1 = &ev.p[1];
        if let Some(second) = self.store.get_event(p1)? {
            if second.c == ev.c && !waived(parent_round(p1)?) {
                return Err(PrismaError::SelfParentForked(id.clone()));
            }
        }
        Ok(())
    }

    /// Insert a validated event: write the height, store the event, queue it
    /// for ordering. Re-inserting a known event changes nothing.
    pub fn add_event(&mut self, id: &EventId, ev: &Event) -> Result<(), PrismaError> {
        if self.store.event_exists(id) {
            return Ok(());
        }
        let height = if ev.is_root() {
            0
        } else {
            ev.p
                .iter()
                .map(|p| self.height_of(p))
                .max()
                .unwrap_or(0)
                + 1
        };
        self.store.insert_height(id, height)?;
        self.store.insert_event(id, ev)?;
        self.tbd.insert(id.clone());
        Ok(())
    }
}

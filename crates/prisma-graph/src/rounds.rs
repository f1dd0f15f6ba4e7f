use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;

use prisma_core::error::PrismaError;
use prisma_core::types::{EventId, Round, VerifyKeyHex};

use crate::graph::Graph;

impl Graph {
    /// Assign rounds to a batch of freshly inserted events (topological
    /// order required: parents before children).
    ///
    /// Roots open round 0 as their own witness. A non-root inherits
    /// `r = max(parent rounds)` and is promoted to `r + 1` when it strongly
    /// sees a supermajority of round-r witnesses; the first event of a
    /// creator in a new round becomes that creator's witness.
    pub fn divide_rounds(&mut self, events: &[EventId]) -> Result<(), PrismaError> {
        for id in events {
            let Some(ev) = self.store.get_event(id)? else {
                debug!(event = %id, "divide_rounds: event vanished, skipping");
                continue;
            };

            if ev.is_root() {
                self.store.insert_round(id, 0)?;
                self.store.insert_witness(0, &ev.c, id)?;
                let mut sees = BTreeMap::new();
                sees.insert(ev.c.clone(), id.clone());
                self.store.insert_can_see(id, &sees)?;
                continue;
            }

            // Pruned parents sit at or below the signed boundary.
            let parent_round = |g: &Graph, p: &EventId| -> Result<Round, PrismaError> {
                Ok(g.store.get_round(p)?.unwrap_or(g.last_signed_state))
            };
            let r = ev
                .p
                .iter()
                .map(|p| parent_round(self, p))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .max()
                .unwrap_or(0);

            // can_see recurrence: merge the parents' views per creator,
            // keeping the higher event.
            let p0 = self.store.get_can_see(&ev.p[0])?;
            let p1 = self.store.get_can_see(&ev.p[1])?;
            let mut merged: BTreeMap<VerifyKeyHex, EventId> = BTreeMap::new();
            for creator in p0.keys().chain(p1.keys()) {
                if let Some(best) = self.maxi(p0.get(creator), p1.get(creator)) {
                    merged.insert(creator.clone(), best);
                }
            }
            self.store.insert_can_see(id, &merged)?;

            let promoted = self.strongly_see(id, r)?.len() as u64 >= self.min_stake;
            let own_round = if promoted { r + 1 } else { r };
            self.store.insert_round(id, own_round)?;
            debug!(event = %id, round = own_round, promoted, "assigned round");

            // A non-promoted event records itself as its creator's highest
            // visible event. A freshly promoted witness does not: its own
            // column must keep pointing one round down so the witness can
            // still strongly see the round it was elected from when it votes.
            if !promoted {
                let mut own = BTreeMap::new();
                own.insert(ev.c.clone(), id.clone());
                self.store.insert_can_see(id, &own)?;
            }

            // First event of this creator past its self-parent's round.
            if own_round > parent_round(self, &ev.p[0])? {
                self.store.insert_witness(own_round, &ev.c, id)?;
            }
        }
        Ok(())
    }

    /// Creators strongly seen from `id` at round `r`: walk the two-step
    /// can_see relation restricted to round-r events and count, per target
    /// creator, how many distinct round-r intermediaries reach it. A creator
    /// is strongly seen when that count reaches the supermajority.
    pub fn strongly_see(
        &self,
        id: &EventId,
        r: Round,
    ) -> Result<BTreeSet<VerifyKeyHex>, PrismaError> {
        let mut hits: BTreeMap<VerifyKeyHex, u64> = BTreeMap::new();
        for (_, k) in self.store.get_can_see(id)? {
            if self.store.get_round(&k)? != Some(r) {
                continue;
            }
            for (creator, k2) in self.store.get_can_see(&k)? {
                if self.store.get_round(&k2)? == Some(r) {
                    // Per-node stake is 1.
                    *hits.entry(creator).or_insert(0) += 1;
                }
            }
        }
        Ok(hits
            .into_iter()
            .filter(|(_, n)| *n >= self.min_stake)
            .map(|(c, _)| c)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prisma_crypto::keypair::KeyPair;
    use prisma_store::StoreDb;

    use super::*;

    /// Fixture with four creators, each contributing a root event.
    struct Net {
        graphs: Vec<Graph>,
    }

    impl Net {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("prisma_rounds_test_{name}"));
            let _ = std::fs::remove_dir_all(&dir);
            let store = Arc::new(StoreDb::open(&dir).unwrap());
            let graphs = (0..4)
                .map(|_| Graph::new(store.clone(), KeyPair::generate(), 4).unwrap())
                .collect();
            Net { graphs }
        }

        fn store(&self) -> &StoreDb {
            &self.graphs[0].store
        }

        /// Insert node `i`'s event and run divide_rounds on it everywhere.
        fn emit(&mut self, i: usize, parents: Vec<EventId>) -> EventId {
            let (id, ev) = self.graphs[i].new_event(vec![], parents).unwrap();
            for g in &mut self.graphs {
                g.add_event(&id, &ev).unwrap();
            }
            self.graphs[0].divide_rounds(&[id.clone()]).unwrap();
            id
        }
    }

    #[test]
    fn roots_open_round_zero() {
        let mut net = Net::new("roots");
        let a = net.emit(0, vec![]);
        assert_eq!(net.store().get_round(&a).unwrap(), Some(0));
        let witnesses = net.store().get_witness(0).unwrap();
        assert_eq!(witnesses.len(), 1);
        let sees = net.store().get_can_see(&a).unwrap();
        assert_eq!(sees.values().next().unwrap(), &a);
    }

    #[test]
    fn child_round_bounded_by_parents() {
        let mut net = Net::new("bounds");
        let a = net.emit(0, vec![]);
        let b = net.emit(1, vec![]);
        let child = net.emit(0, vec![a.clone(), b.clone()]);

        let r_child = net.store().get_round(&child).unwrap().unwrap();
        let r_max = net.store().get_round(&a).unwrap().unwrap()
            .max(net.store().get_round(&b).unwrap().unwrap());
        assert!(r_child >= r_max && r_child <= r_max + 1);
        // Two visible creators out of four cannot strongly see a supermajority.
        assert_eq!(r_child, 0);
    }

    #[test]
    fn can_see_merges_and_includes_self() {
        let mut net = Net::new("cansee");
        let a = net.emit(0, vec![]);
        let b = net.emit(1, vec![]);
        let child = net.emit(0, vec![a, b.clone()]);

        let sees = net.store().get_can_see(&child).unwrap();
        assert_eq!(sees.len(), 2);
        // The creator's own entry was promoted from the root to the child.
        let my_key = net.graphs[0].verify_key().clone();
        assert_eq!(sees[&my_key], child);
        let other_key = net.graphs[1].verify_key().clone();
        assert_eq!(sees[&other_key], b);
    }

    /// Ring gossip across 4 creators: b1=(b0,a0), c1=(c0,b1), d1=(d0,c1),
    /// a1=(a0,d1), b2=(b1,a1). At b2 the can_see chain reaches three
    /// creators whose round-0 views each cover a supermajority, so b2 is
    /// promoted to round 1 and becomes B's round-1 witness.
    #[test]
    fn ring_gossip_promotes_to_round_one() {
        let mut net = Net::new("promote");
        let a0 = net.emit(0, vec![]);
        let b0 = net.emit(1, vec![]);
        let c0 = net.emit(2, vec![]);
        let d0 = net.emit(3, vec![]);

        let b1 = net.emit(1, vec![b0, a0.clone()]);
        let c1 = net.emit(2, vec![c0, b1.clone()]);
        let d1 = net.emit(3, vec![d0, c1.clone()]);
        let a1 = net.emit(0, vec![a0, d1]);
        let b2 = net.emit(1, vec![b1, a1]);

        assert_eq!(net.store().get_round(&b2).unwrap(), Some(1));
        let round1 = net.store().get_witness(1).unwrap();
        let b_key = net.graphs[1].verify_key().clone();
        assert_eq!(round1.get(&b_key), Some(&b2));

        // The next event of C inherits round 1 from its other-parent and
        // becomes C's round-1 witness without being promoted itself.
        let c2 = net.emit(2, vec![c1, b2]);
        assert_eq!(net.store().get_round(&c2).unwrap(), Some(1));
        let round1 = net.store().get_witness(1).unwrap();
        let c_key = net.graphs[2].verify_key().clone();
        assert_eq!(round1.get(&c_key), Some(&c2));
    }
}

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use prisma_core::constants::min_stake;
use prisma_core::error::PrismaError;
use prisma_core::event::Event;
use prisma_core::types::{Address, EventId, Height, Round, Stake, VerifyKeyHex};
use prisma_crypto::keypair::{verify_attached, KeyPair, SignedData};
use prisma_store::StoreDb;

/// The consensus engine.
///
/// Owns the mutable consensus state (head pointer, the to-be-decided set,
/// checkpoint counters) on top of the persistent store. All mutation runs on
/// one task; the round/fame/order passes assume serial observation of the
/// DAG.
pub struct Graph {
    pub store: Arc<StoreDb>,
    pub(crate) keypair: KeyPair,
    pub address: Address,
    pub total_stake: Stake,
    pub min_stake: Stake,
    /// Checkpoint stride, in consensus rounds.
    pub to_sign_count: usize,
    /// Last round folded into a finalized signed state.
    pub last_signed_state: Round,
    /// Decided consensus rounds not yet covered by a created state signature.
    pub unsent_count: usize,
    /// Events awaiting a final order.
    pub tbd: HashSet<EventId>,
}

impl Graph {
    pub fn new(store: Arc<StoreDb>, keypair: KeyPair, total_stake: Stake) -> Result<Self, PrismaError> {
        let address = keypair.address()?;
        Ok(Self {
            store,
            address,
            keypair,
            total_stake,
            min_stake: min_stake(total_stake),
            to_sign_count: prisma_core::constants::STATE_ROUND_STRIDE as usize,
            last_signed_state: 0,
            unsent_count: 0,
            tbd: HashSet::new(),
        })
    }

    pub fn verify_key(&self) -> &VerifyKeyHex {
        self.keypair.verify_key_hex()
    }

    /// Sign with the node key, attached + detached forms.
    pub fn sign_attached(&self, message: &[u8]) -> SignedData {
        self.keypair.sign(message)
    }

    /// Bring the engine up: restore counters, re-verify stored events,
    /// create the local root on first run, rebuild `tbd`.
    pub fn init(&mut self) -> Result<(), PrismaError> {
        self.last_signed_state = self.store.get_consensus_last_signed()?;
        debug!(last_signed_state = self.last_signed_state, "graph init");

        let is_empty = self.verify_stored_events()?;
        if is_empty {
            self.create_root_event()?;
        } else {
            debug!("reconnecting to existing graph");
            self.rebuild_tbd()?;
        }

        self.unsent_count = self
            .store
            .get_consensus_greater_than(self.store.get_consensus_last_created_sign()?, 0)?
            .len();
        Ok(())
    }

    /// Re-validate every stored event on startup. A corrupt event means the
    /// store can no longer be trusted; that is fatal.
    fn verify_stored_events(&self) -> Result<bool, PrismaError> {
        let events = self.store.get_events_many()?;
        if events.is_empty() {
            return Ok(true);
        }
        info!(count = events.len(), "verifying events stored in database");
        for (id, ev) in &events {
            if let Err(e) = self.is_valid_event(id, ev) {
                error!(event = %id, error = %e, "stored event failed validation");
                return Err(PrismaError::Storage(format!(
                    "corrupt stored event {id}: {e}"
                )));
            }
        }
        Ok(false)
    }

    /// First-run invariant: every node starts its chain with a root event
    /// which is its own round-0 witness and sees itself.
    pub fn create_root_event(&mut self) -> Result<EventId, PrismaError> {
        let (id, ev) = self.new_event(vec![], vec![])?;
        self.add_event(&id, &ev)?;
        self.store.insert_round(&id, 0)?;
        self.store.insert_witness(0, &ev.c, &id)?;
        let mut sees = BTreeMap::new();
        sees.insert(ev.c.clone(), id.clone());
        self.store.insert_can_see(&id, &sees)?;
        self.store.set_head(&id)?;
        debug!(root = %id, "created root event");
        Ok(id)
    }

    /// `tbd` is transient; after a restart it is the set of stored events
    /// that never received a final order.
    fn rebuild_tbd(&mut self) -> Result<(), PrismaError> {
        for (id, _) in self.store.get_events_many()? {
            if !self.store.is_event_ordered(&id)? {
                self.tbd.insert(id);
            }
        }
        Ok(())
    }

    // ── Height helpers ───────────────────────────────────────────────────────

    pub(crate) fn height_of(&self, id: &str) -> Height {
        self.store.get_height(id).ok().flatten().unwrap_or(0)
    }

    /// Is `a` at least as high as `b`? Missing operands lose.
    pub(crate) fn higher(&self, a: Option<&EventId>, b: Option<&EventId>) -> bool {
        match (a, b) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(a), Some(b)) => self.height_of(a) >= self.height_of(b),
        }
    }

    /// The higher of two optional events.
    pub(crate) fn maxi(&self, a: Option<&EventId>, b: Option<&EventId>) -> Option<EventId> {
        if self.higher(a, b) {
            a.cloned()
        } else {
            b.cloned()
        }
    }

    /// Parents of an event with pruned (already checkpointed) parents
    /// filtered out, so traversals never walk below the signed boundary.
    pub(crate) fn live_parents(&self, ev: &Event) -> Result<Vec<EventId>, PrismaError> {
        let mut live = Vec::new();
        for p in &ev.p {
            match self.store.get_round(p)? {
                Some(r) if r <= self.last_signed_state => continue,
                _ => live.push(p.clone()),
            }
        }
        Ok(live)
    }

    // ── Sync-out: what we know, what the peer lacks ──────────────────────────

    /// Signed summary of what this node has per creator: the height of the
    /// highest event of each creator visible from the head.
    pub fn event_info_response(&self) -> Result<Option<SignedData>, PrismaError> {
        let Some(head) = self.store.get_head()? else {
            return Ok(None);
        };
        let mut info: BTreeMap<VerifyKeyHex, Height> = BTreeMap::new();
        for (creator, id) in self.store.get_can_see(&head)? {
            info.insert(creator, self.height_of(&id));
        }
        let json =
            serde_json::to_vec(&info).map_err(|e| PrismaError::Serialization(e.to_string()))?;
        Ok(Some(self.sign_attached(&json)))
    }

    /// Answer a peer's event_info with the signed subset of events it lacks:
    /// BFS from our head, descending into a parent only while the asker has
    /// not yet seen that creator up to the parent's height.
    pub fn events_subset_response(
        &self,
        event_info: &SignedData,
    ) -> Result<Option<SignedData>, PrismaError> {
        let Some(head) = self.store.get_head()? else {
            return Ok(None);
        };
        let msg = verify_attached(&event_info.verify_key, &event_info.signed)?;
        let known: BTreeMap<VerifyKeyHex, Height> = serde_json::from_slice(&msg)
            .map_err(|e| PrismaError::Serialization(e.to_string()))?;

        let frontier = bfs([head.clone()], |u| {
            let mut next = Vec::new();
            if let Ok(Some(ev)) = self.store.get_event(u) {
                for p in self.live_parents(&ev).unwrap_or_default() {
                    let Ok(Some(parent)) = self.store.get_event(&p) else {
                        continue;
                    };
                    let wanted = match known.get(&parent.c) {
                        None => true,
                        Some(have) => self.height_of(&p) > *have,
                    };
                    if wanted {
                        next.push(p);
                    }
                }
            }
            next
        });

        let mut subset: BTreeMap<EventId, Event> = BTreeMap::new();
        for id in frontier {
            if let Some(ev) = self.store.get_event(&id)? {
                subset.insert(id, ev);
            }
        }
        let response = serde_json::to_vec(&(&head, &subset))
            .map_err(|e| PrismaError::Serialization(e.to_string()))?;
        Ok(Some(self.sign_attached(&response)))
    }

    // ── Sync-in: accepting a peer's events ───────────────────────────────────

    /// Open a signed `get_events` response and drop everything we already
    /// know or that lies below the signed-state boundary.
    pub fn validate_remote_events(
        &self,
        events_sign: &SignedData,
    ) -> Result<(BTreeMap<EventId, Event>, EventId), PrismaError> {
        let msg = verify_attached(&events_sign.verify_key, &events_sign.signed)?;
        let (remote_head, mut remote_cg): (EventId, BTreeMap<EventId, Event>) =
            serde_json::from_slice(&msg)
                .map_err(|e| PrismaError::Serialization(e.to_string()))?;

        let mut drop_ids = Vec::new();
        for id in remote_cg.keys() {
            let stale = matches!(
                self.store.get_round(id)?,
                Some(r) if r <= self.last_signed_state
            );
            if stale || self.store.event_exists(id) {
                drop_ids.push(id.clone());
            }
        }
        for id in &drop_ids {
            debug!(event = %id, "dropping already-known remote event");
            remote_cg.remove(id);
        }
        Ok((remote_cg, remote_head))
    }

    /// Validate and insert a batch of remote events in topological order,
    /// then extend the local chain with a new event referencing both heads.
    /// Returns the inserted ids (remote plus our own) in processing order.
    pub fn insert_new_events(
        &mut self,
        remote_cg: &BTreeMap<EventId, Event>,
        remote_head: &EventId,
        payload: Vec<String>,
    ) -> Result<Option<Vec<EventId>>, PrismaError> {
        let order = toposort(remote_cg.keys().cloned(), |id| {
            remote_cg
                .get(id)
                .map(|ev| ev.p.clone())
                .unwrap_or_default()
        })?;

        let mut inserted = Vec::new();
        for id in &order {
            let ev = &remote_cg[id];
            match self.is_valid_event(id, ev) {
                Ok(()) => {
                    self.add_event(id, ev)?;
                    inserted.push(id.clone());
                }
                Err(e) => debug!(event = %id, error = %e, "remote event not valid"),
            }
        }

        if !remote_cg.contains_key(remote_head) || !self.store.event_exists(remote_head) {
            warn!(head = %remote_head, "remote head missing after insertion");
            return Ok(None);
        }

        let Some(local_head) = self.store.get_head()? else {
            warn!("no local head; cannot extend chain");
            return Ok(None);
        };
        let (id, ev) =
            self.new_event(payload, vec![local_head, remote_head.clone()])?;
        self.is_valid_event(&id, &ev)?;
        self.add_event(&id, &ev)?;
        self.store.set_head(&id)?;
        inserted.push(id);
        Ok(Some(inserted))
    }

    // ── Cold start ───────────────────────────────────────────────────────────

    /// Reinitialize the DAG at a checkpoint received from a peer: drop local
    /// DAG collections, install the bootstrap tables, and restart the local
    /// chain with a fresh root.
    pub fn reinitialize_from_sync(
        &mut self,
        rounds: BTreeMap<EventId, Round>,
        heights: BTreeMap<EventId, Height>,
        witnesses: BTreeMap<Round, BTreeMap<VerifyKeyHex, EventId>>,
        checkpoint_round: Round,
    ) -> Result<(), PrismaError> {
        self.store.drop_dag_collections()?;
        for (id, r) in rounds {
            self.store.insert_round(&id, r)?;
        }
        for (id, h) in heights {
            self.store.insert_height(&id, h)?;
        }
        for (r, map) in witnesses {
            self.store.insert_witness_map(r, &map)?;
        }
        self.store.insert_consensus(&[checkpoint_round], true)?;
        self.store.set_consensus_last_sent(checkpoint_round)?;
        self.store.set_consensus_last_created_sign(checkpoint_round)?;
        self.last_signed_state = checkpoint_round;
        self.unsent_count = 0;
        self.tbd.clear();
        self.create_root_event()?;
        info!(round = checkpoint_round, "reinitialized from signed-state chain");
        Ok(())
    }
}

// ── Traversals ───────────────────────────────────────────────────────────────

/// Breadth-first search; returns nodes in visit order, start nodes included.
pub fn bfs<F, I>(start: impl IntoIterator<Item = EventId>, mut succ: F) -> Vec<EventId>
where
    F: FnMut(&EventId) -> I,
    I: IntoIterator<Item = EventId>,
{
    let mut queue: VecDeque<EventId> = start.into_iter().collect();
    let mut seen: HashSet<EventId> = queue.iter().cloned().collect();
    let mut out = Vec::new();
    while let Some(u) = queue.pop_front() {
        for v in succ(&u) {
            if seen.insert(v.clone()) {
                queue.push_back(v);
            }
        }
        out.push(u);
    }
    out
}

/// Topological sort (parents before children) over a batch of event ids.
/// Parents outside the batch are ignored; a cycle is a protocol error.
pub fn toposort<F>(ids: impl IntoIterator<Item = EventId>, parents: F) -> Result<Vec<EventId>, PrismaError>
where
    F: Fn(&EventId) -> Vec<EventId>,
{
    let batch: Vec<EventId> = ids.into_iter().collect();
    let members: HashSet<EventId> = batch.iter().cloned().collect();
    // 0 = visiting, 1 = done
    let mut seen: BTreeMap<EventId, u8> = BTreeMap::new();
    let mut out = Vec::new();

    fn visit(
        u: &EventId,
        members: &HashSet<EventId>,
        parents: &impl Fn(&EventId) -> Vec<EventId>,
        seen: &mut BTreeMap<EventId, u8>,
        out: &mut Vec<EventId>,
    ) -> Result<(), PrismaError> {
        match seen.get(u) {
            Some(0) => return Err(PrismaError::Peer("event batch is not a DAG".into())),
            Some(_) => return Ok(()),
            None => {}
        }
        if !members.contains(u) {
            return Ok(());
        }
        seen.insert(u.clone(), 0);
        for v in parents(u) {
            visit(&v, members, parents, seen, out)?;
        }
        seen.insert(u.clone(), 1);
        out.push(u.clone());
        Ok(())
    }

    for u in &batch {
        visit(u, &members, &parents, &mut seen, &mut out)?;
    }
    Ok(out)
}

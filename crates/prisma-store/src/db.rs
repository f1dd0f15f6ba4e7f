use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rand::seq::SliceRandom;

use prisma_core::error::PrismaError;
use prisma_core::event::Event;
use prisma_core::transaction::TX_TYPE_TRANSFER;
use prisma_core::types::{Address, Amount, EventId, Height, Round, Timestamp, VerifyKeyHex};

use crate::records::{PeerInfo, SignatureEntry, State, StateSignatures, StoredState, StoredTransaction};

/// Persistent node store backed by sled (pure-Rust, no C dependencies).
///
/// Named trees, one per collection:
///   events       — event id utf8      → bincode(Event)
///   height       — event id utf8      → u64 be
///   rounds       — event id utf8      → i64 offset-binary be
///   can_see      — event id utf8      → bincode(BTreeMap<creator, event id>)
///   head         — b"head"            → event id utf8
///   peers        — peer id utf8       → bincode(PeerInfo)
///   witness      — round key          → bincode(BTreeMap<creator, event id>)
///   famous       — event id utf8      → [0|1]
///   votes        — voter id utf8      → bincode(BTreeMap<subject id, bool>)
///   transactions — sled generated u64 → bincode(StoredTransaction)
///   consensus    — round key          → [signed: 0|1]
///   signature    — round key          → bincode(StateSignatures)
///   state        — round key          → bincode(StoredState)
///   meta         — utf8 key           → raw bytes
pub struct StoreDb {
    db: sled::Db,
    events: sled::Tree,
    height: sled::Tree,
    rounds: sled::Tree,
    can_see: sled::Tree,
    head: sled::Tree,
    peers: sled::Tree,
    witness: sled::Tree,
    famous: sled::Tree,
    votes: sled::Tree,
    transactions: sled::Tree,
    consensus: sled::Tree,
    signature: sled::Tree,
    state: sled::Tree,
    meta: sled::Tree,
}

fn store_err(e: impl std::fmt::Display) -> PrismaError {
    PrismaError::Storage(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> PrismaError {
    PrismaError::Serialization(e.to_string())
}

/// Rounds can be negative (the genesis state sits at -1); flipping the sign
/// bit makes the big-endian byte order match the numeric order.
fn round_key(r: Round) -> [u8; 8] {
    ((r as u64) ^ (1 << 63)).to_be_bytes()
}

fn round_from_key(key: &[u8]) -> Round {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[..8]);
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

impl StoreDb {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PrismaError> {
        let db = sled::open(path).map_err(store_err)?;
        let tree = |name: &str| db.open_tree(name).map_err(store_err);
        Ok(Self {
            events: tree("events")?,
            height: tree("height")?,
            rounds: tree("rounds")?,
            can_see: tree("can_see")?,
            head: tree("head")?,
            peers: tree("peers")?,
            witness: tree("witness")?,
            famous: tree("famous")?,
            votes: tree("votes")?,
            transactions: tree("transactions")?,
            consensus: tree("consensus")?,
            signature: tree("signature")?,
            state: tree("state")?,
            meta: tree("meta")?,
            db,
        })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), PrismaError> {
        self.db.flush().map_err(store_err)?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn get_event(&self, id: &str) -> Result<Option<Event>, PrismaError> {
        match self.events.get(id.as_bytes()).map_err(store_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn event_exists(&self, id: &str) -> bool {
        self.events.contains_key(id.as_bytes()).unwrap_or(false)
    }

    /// Insert an event. Re-inserting an existing id is a no-op.
    pub fn insert_event(&self, id: &EventId, event: &Event) -> Result<(), PrismaError> {
        if self.event_exists(id) {
            return Ok(());
        }
        let bytes = bincode::serialize(event).map_err(ser_err)?;
        self.events.insert(id.as_bytes(), bytes).map_err(store_err)?;
        Ok(())
    }

    pub fn delete_event(&self, id: &str) -> Result<(), PrismaError> {
        self.events.remove(id.as_bytes()).map_err(store_err)?;
        Ok(())
    }

    /// All stored events, oldest creation time first.
    pub fn get_events_many(&self) -> Result<Vec<(EventId, Event)>, PrismaError> {
        let mut out = Vec::new();
        for item in self.events.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            let id = String::from_utf8_lossy(&key).into_owned();
            let ev: Event = bincode::deserialize(&bytes).map_err(ser_err)?;
            out.push((id, ev));
        }
        out.sort_by(|a, b| a.1.t.total_cmp(&b.1.t));
        Ok(out)
    }

    /// Creation time of the newest stored event, 0.0 when empty.
    pub fn get_latest_event_time(&self) -> Result<Timestamp, PrismaError> {
        let mut latest = 0.0f64;
        for item in self.events.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            let ev: Event = bincode::deserialize(&bytes).map_err(ser_err)?;
            if ev.t > latest {
                latest = ev.t;
            }
        }
        Ok(latest)
    }

    // ── Heights ──────────────────────────────────────────────────────────────

    pub fn get_height(&self, id: &str) -> Result<Option<Height>, PrismaError> {
        match self.height.get(id.as_bytes()).map_err(store_err)? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            None => Ok(None),
        }
    }

    pub fn insert_height(&self, id: &str, height: Height) -> Result<(), PrismaError> {
        self.height
            .insert(id.as_bytes(), &height.to_be_bytes()[..])
            .map_err(store_err)?;
        Ok(())
    }

    pub fn get_heights_many(&self) -> Result<BTreeMap<EventId, Height>, PrismaError> {
        let mut out = BTreeMap::new();
        for item in self.height.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            out.insert(
                String::from_utf8_lossy(&key).into_owned(),
                u64::from_be_bytes(buf),
            );
        }
        Ok(out)
    }


    // ── Rounds ───────────────────────────────────────────────────────────────

    pub fn get_round(&self, id: &str) -> Result<Option<Round>, PrismaError> {
        match self.rounds.get(id.as_bytes()).map_err(store_err)? {
            Some(bytes) => Ok(Some(round_from_key(&bytes))),
            None => Ok(None),
        }
    }

    pub fn insert_round(&self, id: &str, round: Round) -> Result<(), PrismaError> {
        self.rounds
            .insert(id.as_bytes(), &round_key(round)[..])
            .map_err(store_err)?;
        Ok(())
    }

    pub fn get_rounds_many(&self) -> Result<BTreeMap<EventId, Round>, PrismaError> {
        let mut out = BTreeMap::new();
        for item in self.rounds.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            out.insert(
                String::from_utf8_lossy(&key).into_owned(),
                round_from_key(&bytes),
            );
        }
        Ok(out)
    }

    /// Ids of all events whose round is ≤ `r` (the prune frontier).
    pub fn get_rounds_hash_list(&self, r: Round) -> Result<Vec<EventId>, PrismaError> {
        let mut out = Vec::new();
        for item in self.rounds.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            if round_from_key(&bytes) <= r {
                out.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(out)
    }

    // ── CanSee ───────────────────────────────────────────────────────────────

    pub fn get_can_see(&self, id: &str) -> Result<BTreeMap<VerifyKeyHex, EventId>, PrismaError> {
        match self.can_see.get(id.as_bytes()).map_err(store_err)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes).map_err(ser_err)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Merge entries into the event's can_see map; per-creator, the newest
    /// write wins.
    pub fn insert_can_see(
        &self,
        id: &str,
        entries: &BTreeMap<VerifyKeyHex, EventId>,
    ) -> Result<(), PrismaError> {
        let mut map = self.get_can_see(id)?;
        for (creator, seen) in entries {
            map.insert(creator.clone(), seen.clone());
        }
        let bytes = bincode::serialize(&map).map_err(ser_err)?;
        self.can_see.insert(id.as_bytes(), bytes).map_err(store_err)?;
        Ok(())
    }

    pub fn delete_can_see(&self, id: &str) -> Result<(), PrismaError> {
        self.can_see.remove(id.as_bytes()).map_err(store_err)?;
        Ok(())
    }

    /// Drop every reference to pruned events from surviving can_see maps.
    pub fn delete_references_can_see(&self, pruned: &[EventId]) -> Result<(), PrismaError> {
        let pruned: BTreeSet<&EventId> = pruned.iter().collect();
        for item in self.can_see.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            let mut map: BTreeMap<VerifyKeyHex, EventId> =
                bincode::deserialize(&bytes).map_err(ser_err)?;
            let before = map.len();
            map.retain(|_, seen| !pruned.contains(seen));
            if map.len() != before {
                let bytes = bincode::serialize(&map).map_err(ser_err)?;
                self.can_see.insert(key, bytes).map_err(store_err)?;
            }
        }
        Ok(())
    }

    // ── Head ─────────────────────────────────────────────────────────────────

    pub fn get_head(&self) -> Result<Option<EventId>, PrismaError> {
        Ok(self
            .head
            .get(b"head")
            .map_err(store_err)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn set_head(&self, id: &str) -> Result<(), PrismaError> {
        self.head.insert(b"head", id.as_bytes()).map_err(store_err)?;
        Ok(())
    }

    // ── Witnesses ────────────────────────────────────────────────────────────

    pub fn get_witness(&self, r: Round) -> Result<BTreeMap<VerifyKeyHex, EventId>, PrismaError> {
        match self.witness.get(round_key(r)).map_err(store_err)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes).map_err(ser_err)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Record a witness. The first (lowest-height) event of a creator in a
    /// round wins; later writes for the same creator are ignored.
    pub fn insert_witness(
        &self,
        r: Round,
        creator: &str,
        id: &EventId,
    ) -> Result<(), PrismaError> {
        let mut map = self.get_witness(r)?;
        if map.contains_key(creator) {
            return Ok(());
        }
        map.insert(creator.to_string(), id.clone());
        let bytes = bincode::serialize(&map).map_err(ser_err)?;
        self.witness.insert(round_key(r), bytes).map_err(store_err)?;
        Ok(())
    }

    /// Install a full witness table for a round (cold-start bootstrap).
    pub fn insert_witness_map(
        &self,
        r: Round,
        map: &BTreeMap<VerifyKeyHex, EventId>,
    ) -> Result<(), PrismaError> {
        let bytes = bincode::serialize(map).map_err(ser_err)?;
        self.witness.insert(round_key(r), bytes).map_err(store_err)?;
        Ok(())
    }

    /// Largest round with a recorded witness, 0 when empty.
    pub fn get_witness_max_round(&self) -> Result<Round, PrismaError> {
        match self.witness.last().map_err(store_err)? {
            Some((key, _)) => Ok(round_from_key(&key)),
            None => Ok(0),
        }
    }

    pub fn delete_witnesses_less_than(&self, r: Round) -> Result<(), PrismaError> {
        let mut doomed = Vec::new();
        for item in self.witness.range(..round_key(r).to_vec()) {
            let (key, _) = item.map_err(store_err)?;
            doomed.push(key);
        }
        for key in doomed {
            self.witness.remove(key).map_err(store_err)?;
        }
        Ok(())
    }

    // ── Famous ───────────────────────────────────────────────────────────────

    pub fn get_famous(&self, id: &str) -> Result<Option<bool>, PrismaError> {
        Ok(self
            .famous
            .get(id.as_bytes())
            .map_err(store_err)?
            .map(|v| v[0] == 1))
    }

    pub fn check_famous(&self, id: &str) -> bool {
        self.famous.contains_key(id.as_bytes()).unwrap_or(false)
    }

    pub fn insert_famous(&self, id: &str, famous: bool) -> Result<(), PrismaError> {
        self.famous
            .insert(id.as_bytes(), &[famous as u8][..])
            .map_err(store_err)?;
        Ok(())
    }

    pub fn delete_famous(&self, id: &str) -> Result<(), PrismaError> {
        self.famous.remove(id.as_bytes()).map_err(store_err)?;
        Ok(())
    }

    // ── Votes ────────────────────────────────────────────────────────────────

    pub fn get_votes(&self, voter: &str) -> Result<BTreeMap<EventId, bool>, PrismaError> {
        match self.votes.get(voter.as_bytes()).map_err(store_err)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes).map_err(ser_err)?),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn insert_vote(&self, voter: &str, subject: &str, vote: bool) -> Result<(), PrismaError> {
        let mut map = self.get_votes(voter)?;
        map.insert(subject.to_string(), vote);
        let bytes = bincode::serialize(&map).map_err(ser_err)?;
        self.votes.insert(voter.as_bytes(), bytes).map_err(store_err)?;
        Ok(())
    }

    pub fn delete_votes(&self, voter: &str) -> Result<(), PrismaError> {
        self.votes.remove(voter.as_bytes()).map_err(store_err)?;
        Ok(())
    }

    // ── Peers ────────────────────────────────────────────────────────────────

    pub fn insert_peer(&self, peer: &PeerInfo) -> Result<(), PrismaError> {
        let bytes = bincode::serialize(peer).map_err(ser_err)?;
        self.peers.insert(peer.id.as_bytes(), bytes).map_err(store_err)?;
        Ok(())
    }

    pub fn get_peers_many(&self) -> Result<Vec<PeerInfo>, PrismaError> {
        let mut out = Vec::new();
        for item in self.peers.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(out)
    }

    pub fn get_random_peer(&self) -> Result<Option<PeerInfo>, PrismaError> {
        let peers = self.get_peers_many()?;
        Ok(peers.choose(&mut rand::thread_rng()).cloned())
    }

    pub fn count_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn delete_peer(&self, id: &str) -> Result<(), PrismaError> {
        self.peers.remove(id.as_bytes()).map_err(store_err)?;
        Ok(())
    }

    pub fn delete_peers(&self) -> Result<(), PrismaError> {
        self.peers.clear().map_err(store_err)?;
        Ok(())
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    pub fn insert_transactions(&self, txs: &[StoredTransaction]) -> Result<(), PrismaError> {
        for tx in txs {
            let id = self.db.generate_id().map_err(store_err)?;
            let bytes = bincode::serialize(tx).map_err(ser_err)?;
            self.transactions
                .insert(id.to_be_bytes(), bytes)
                .map_err(store_err)?;
        }
        Ok(())
    }

    pub fn get_transactions_many(&self) -> Result<Vec<StoredTransaction>, PrismaError> {
        let mut out = Vec::new();
        for item in self.transactions.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(out)
    }

    /// Pool view: transactions not yet embedded into an event — the local
    /// wallet's transfers plus any state signatures awaiting broadcast.
    /// Returns (storage ids, hex payloads).
    pub fn get_unsent_transactions(
        &self,
        my_address: &str,
    ) -> Result<(Vec<u64>, Vec<String>), PrismaError> {
        let mut ids = Vec::new();
        let mut hexes = Vec::new();
        for item in self.transactions.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            let tx: StoredTransaction = bincode::deserialize(&bytes).map_err(ser_err)?;
            if tx.event_hash.is_none()
                && (tx.sender_id == my_address || tx.tx_type != TX_TYPE_TRANSFER)
            {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[..8]);
                ids.push(u64::from_be_bytes(buf));
                hexes.push(tx.tx_dict_hex.clone());
            }
        }
        Ok((ids, hexes))
    }

    /// Mark pooled transactions as embedded into `event_hash`.
    pub fn set_transaction_event_hash(
        &self,
        ids: &[u64],
        event_hash: &EventId,
    ) -> Result<(), PrismaError> {
        for id in ids {
            if let Some(bytes) = self.transactions.get(id.to_be_bytes()).map_err(store_err)? {
                let mut tx: StoredTransaction = bincode::deserialize(&bytes).map_err(ser_err)?;
                tx.event_hash = Some(event_hash.clone());
                let bytes = bincode::serialize(&tx).map_err(ser_err)?;
                self.transactions
                    .insert(id.to_be_bytes(), bytes)
                    .map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Stamp the final round onto every transaction embedded in `event_hash`.
    pub fn set_transaction_round(&self, event_hash: &str, r: Round) -> Result<(), PrismaError> {
        for item in self.transactions.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            let mut tx: StoredTransaction = bincode::deserialize(&bytes).map_err(ser_err)?;
            if tx.event_hash.as_deref() == Some(event_hash) {
                tx.round = Some(r);
                let bytes = bincode::serialize(&tx).map_err(ser_err)?;
                self.transactions.insert(key, bytes).map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// True once any transaction embedded in the event carries a final round.
    pub fn is_event_ordered(&self, event_hash: &str) -> Result<bool, PrismaError> {
        for item in self.transactions.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            let tx: StoredTransaction = bincode::deserialize(&bytes).map_err(ser_err)?;
            if tx.event_hash.as_deref() == Some(event_hash) && tx.round.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn delete_transactions_lte_round(&self, r: Round) -> Result<(), PrismaError> {
        self.delete_tx_filtered(r, false)
    }

    /// Drop ordered money transfers absorbed into a state; signatures and
    /// unordered pool entries survive.
    pub fn delete_money_transfers_lte_round(&self, r: Round) -> Result<(), PrismaError> {
        self.delete_tx_filtered(r, true)
    }

    fn delete_tx_filtered(&self, r: Round, transfers_only: bool) -> Result<(), PrismaError> {
        let mut doomed = Vec::new();
        for item in self.transactions.iter() {
            let (key, bytes) = item.map_err(store_err)?;
            let tx: StoredTransaction = bincode::deserialize(&bytes).map_err(ser_err)?;
            let round_ok = matches!(tx.round, Some(round) if round <= r);
            let type_ok = !transfers_only || tx.tx_type == TX_TYPE_TRANSFER;
            if round_ok && type_ok {
                doomed.push(key);
            }
        }
        for key in doomed {
            self.transactions.remove(key).map_err(store_err)?;
        }
        Ok(())
    }

    // ── Balances ─────────────────────────────────────────────────────────────

    /// Balance of one wallet: latest-state balance plus the transfer delta.
    /// With `range`, only transfers ordered into `[range.0, range.1]` count
    /// (used when building the next state); without it, every known transfer
    /// counts, including the local pool (the soft admission check).
    pub fn get_account_balance(
        &self,
        address: &str,
        range: Option<(Round, Round)>,
    ) -> Result<Amount, PrismaError> {
        let mut delta: Amount = 0;
        for item in self.transactions.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            let tx: StoredTransaction = bincode::deserialize(&bytes).map_err(ser_err)?;
            if tx.tx_type != TX_TYPE_TRANSFER {
                continue;
            }
            if let Some((lo, hi)) = range {
                match tx.round {
                    Some(r) if r >= lo && r <= hi => {}
                    _ => continue,
                }
            }
            if tx.sender_id == address {
                delta -= tx.amount;
            }
            if tx.recipient_id == address {
                delta += tx.amount;
            }
        }
        Ok(delta + self.get_state_balance(address)?)
    }

    /// Balances of every known wallet; zero balances are omitted so the
    /// resulting state maps are identical across nodes.
    pub fn get_account_balance_many(
        &self,
        range: Option<(Round, Round)>,
    ) -> Result<BTreeMap<Address, Amount>, PrismaError> {
        let mut out = BTreeMap::new();
        for address in self.get_all_known_wallets()? {
            let balance = self.get_account_balance(&address, range)?;
            if balance != 0 {
                out.insert(address, balance);
            }
        }
        Ok(out)
    }

    /// Every wallet mentioned by a stored transfer or by the latest state.
    pub fn get_all_known_wallets(&self) -> Result<BTreeSet<Address>, PrismaError> {
        let mut wallets = BTreeSet::new();
        for item in self.transactions.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            let tx: StoredTransaction = bincode::deserialize(&bytes).map_err(ser_err)?;
            if tx.tx_type == TX_TYPE_TRANSFER {
                wallets.insert(tx.sender_id);
                wallets.insert(tx.recipient_id);
            }
        }
        if let Some(stored) = self.get_last_state()? {
            wallets.extend(stored.state.balance.keys().cloned());
        }
        Ok(wallets)
    }

    /// Wallet balance in the latest state, 0 when absent.
    pub fn get_state_balance(&self, address: &str) -> Result<Amount, PrismaError> {
        match self.get_last_state()? {
            Some(stored) => Ok(*stored.state.balance.get(address).unwrap_or(&0)),
            None => Ok(0),
        }
    }

    // ── Consensus ────────────────────────────────────────────────────────────

    pub fn insert_consensus(&self, rounds: &[Round], signed: bool) -> Result<(), PrismaError> {
        for r in rounds {
            self.consensus
                .insert(round_key(*r), &[signed as u8][..])
                .map_err(store_err)?;
        }
        Ok(())
    }

    pub fn check_consensus(&self, r: Round) -> bool {
        self.consensus.contains_key(round_key(r)).unwrap_or(false)
    }

    /// Largest decided consensus round, -1 when none.
    pub fn get_last_consensus(&self) -> Result<Round, PrismaError> {
        match self.consensus.last().map_err(store_err)? {
            Some((key, _)) => Ok(round_from_key(&key)),
            None => Ok(-1),
        }
    }

    /// Consensus rounds strictly greater than `value`, ascending, capped at
    /// `limit` when nonzero.
    pub fn get_consensus_greater_than(
        &self,
        value: Round,
        limit: usize,
    ) -> Result<Vec<Round>, PrismaError> {
        let mut out = Vec::new();
        let start = round_key(value.saturating_add(1)).to_vec();
        for item in self.consensus.range(start..) {
            let (key, _) = item.map_err(store_err)?;
            out.push(round_from_key(&key));
            if limit != 0 && out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    /// Largest consensus round already folded into a signed state, -1 if none.
    pub fn get_consensus_last_signed(&self) -> Result<Round, PrismaError> {
        for item in self.consensus.iter().rev() {
            let (key, value) = item.map_err(store_err)?;
            if value[0] == 1 {
                return Ok(round_from_key(&key));
            }
        }
        Ok(-1)
    }

    /// Mark the `count` lowest unsigned consensus rounds as signed.
    pub fn sign_consensus(&self, count: usize) -> Result<(), PrismaError> {
        let mut remaining = count;
        for item in self.consensus.iter() {
            if remaining == 0 {
                break;
            }
            let (key, value) = item.map_err(store_err)?;
            if value[0] == 0 {
                self.consensus.insert(key, &[1u8][..]).map_err(store_err)?;
                remaining -= 1;
            }
        }
        Ok(())
    }

    pub fn get_consensus_last_sent(&self) -> Result<Round, PrismaError> {
        match self.get_meta_round("last_sent")? {
            Some(r) => Ok(r),
            None => self.get_consensus_last_signed(),
        }
    }

    pub fn set_consensus_last_sent(&self, r: Round) -> Result<(), PrismaError> {
        self.set_meta_round("last_sent", r)
    }

    /// Highest round for which this node already produced a state signature;
    /// falls back through last_sent to the last signed round.
    pub fn get_consensus_last_created_sign(&self) -> Result<Round, PrismaError> {
        match self.get_meta_round("last_created_sign")? {
            Some(r) => Ok(r),
            None => self.get_consensus_last_sent(),
        }
    }

    pub fn set_consensus_last_created_sign(&self, r: Round) -> Result<(), PrismaError> {
        self.set_meta_round("last_created_sign", r)
    }

    fn get_meta_round(&self, key: &str) -> Result<Option<Round>, PrismaError> {
        Ok(self
            .meta
            .get(key.as_bytes())
            .map_err(store_err)?
            .map(|v| round_from_key(&v)))
    }

    fn set_meta_round(&self, key: &str, r: Round) -> Result<(), PrismaError> {
        self.meta
            .insert(key.as_bytes(), &round_key(r)[..])
            .map_err(store_err)?;
        Ok(())
    }

    // ── State signatures ─────────────────────────────────────────────────────

    pub fn get_signature(&self, r: Round) -> Result<Option<StateSignatures>, PrismaError> {
        match self.signature.get(round_key(r)).map_err(store_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    fn put_signature(&self, r: Round, sigs: &StateSignatures) -> Result<(), PrismaError> {
        let bytes = bincode::serialize(sigs).map_err(ser_err)?;
        self.signature.insert(round_key(r), bytes).map_err(store_err)?;
        Ok(())
    }

    /// Record a verified signature. Idempotent per (signer, round).
    pub fn insert_signature(
        &self,
        r: Round,
        hash: &str,
        entry: SignatureEntry,
    ) -> Result<bool, PrismaError> {
        let mut sigs = self.get_signature(r)?.unwrap_or_default();
        if sigs.has_signer(&entry.verify_key) {
            return Ok(false);
        }
        sigs.hash = Some(hash.to_string());
        sigs.sign.push(entry);
        self.put_signature(r, &sigs)?;
        Ok(true)
    }

    /// Park a remote signature until its hash can be compared with ours.
    pub fn insert_signature_unchecked(
        &self,
        r: Round,
        remote_hash: &str,
        entry: SignatureEntry,
    ) -> Result<(), PrismaError> {
        let mut sigs = self.get_signature(r)?.unwrap_or_default();
        sigs.unchecked_pair.push((remote_hash.to_string(), entry));
        self.put_signature(r, &sigs)
    }

    pub fn clear_unchecked_signatures(&self, r: Round) -> Result<(), PrismaError> {
        if let Some(mut sigs) = self.get_signature(r)? {
            sigs.unchecked_pair.clear();
            self.put_signature(r, &sigs)?;
        }
        Ok(())
    }

    pub fn delete_signatures_less_than(&self, r: Round) -> Result<(), PrismaError> {
        let mut doomed = Vec::new();
        for item in self.signature.range(..round_key(r).to_vec()) {
            let (key, _) = item.map_err(store_err)?;
            doomed.push(key);
        }
        for key in doomed {
            self.signature.remove(key).map_err(store_err)?;
        }
        Ok(())
    }

    // ── States ───────────────────────────────────────────────────────────────

    pub fn get_state(&self, r: Round) -> Result<Option<StoredState>, PrismaError> {
        match self.state.get(round_key(r)).map_err(store_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn get_last_state(&self) -> Result<Option<StoredState>, PrismaError> {
        match self.state.last().map_err(store_err)? {
            Some((_, bytes)) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    pub fn insert_state(&self, stored: &StoredState) -> Result<(), PrismaError> {
        let bytes = bincode::serialize(stored).map_err(ser_err)?;
        self.state
            .insert(round_key(stored.state.last_round), bytes)
            .map_err(store_err)?;
        Ok(())
    }

    pub fn set_state_signed(&self, r: Round) -> Result<(), PrismaError> {
        if let Some(mut stored) = self.get_state(r)? {
            stored.signed = true;
            self.insert_state(&stored)?;
        }
        Ok(())
    }

    pub fn delete_signed_states_less_than(&self, r: Round) -> Result<(), PrismaError> {
        let mut doomed = Vec::new();
        for item in self.state.range(..round_key(r).to_vec()) {
            let (key, bytes) = item.map_err(store_err)?;
            let stored: StoredState = bincode::deserialize(&bytes).map_err(ser_err)?;
            if stored.signed {
                doomed.push(key);
            }
        }
        for key in doomed {
            self.state.remove(key).map_err(store_err)?;
        }
        Ok(())
    }

    /// Signed states above `gt` with their signature proofs, ascending —
    /// the chain served to cold-starting peers.
    pub fn get_state_with_proof_many(
        &self,
        gt: Round,
    ) -> Result<Vec<(State, BTreeMap<VerifyKeyHex, String>)>, PrismaError> {
        let mut out = Vec::new();
        let start = round_key(gt.saturating_add(1)).to_vec();
        for item in self.state.range(start..) {
            let (_, bytes) = item.map_err(store_err)?;
            let stored: StoredState = bincode::deserialize(&bytes).map_err(ser_err)?;
            if !stored.signed {
                continue;
            }
            let mut proofs = BTreeMap::new();
            if let Some(sigs) = self.get_signature(stored.state.last_round)? {
                for entry in sigs.sign {
                    proofs.insert(entry.verify_key, entry.signed);
                }
            }
            out.push((stored.state, proofs));
        }
        Ok(out)
    }

    // ── Cold start ───────────────────────────────────────────────────────────

    /// Drop the DAG collections before reinitializing from a state chain.
    /// States, signatures, peers and transactions survive.
    pub fn drop_dag_collections(&self) -> Result<(), PrismaError> {
        for tree in [
            &self.events,
            &self.height,
            &self.rounds,
            &self.can_see,
            &self.witness,
            &self.votes,
            &self.famous,
            &self.head,
        ] {
            tree.clear().map_err(store_err)?;
        }
        Ok(())
    }
}

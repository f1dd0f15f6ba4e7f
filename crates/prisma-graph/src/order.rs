use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use prisma_core::error::PrismaError;
use prisma_core::transaction::StateSignatureTx;
use prisma_core::types::{EventId, Round, Timestamp};

use crate::graph::{bfs, Graph};

/// Signatures are 128 hex characters; the whitening integer is the
/// big-endian interpretation of those ASCII bytes.
const WHITENING_LEN: usize = 128;

type Whitening = [u8; WHITENING_LEN];

/// Big-endian fixed-width integer view of a signature's hex form.
/// Right-aligned so shorter inputs compare like smaller integers.
fn sig_whitening(sig_hex: &str) -> Whitening {
    let ascii = sig_hex.as_bytes();
    let take = ascii.len().min(WHITENING_LEN);
    let mut out = [0u8; WHITENING_LEN];
    out[WHITENING_LEN - take..].copy_from_slice(&ascii[ascii.len() - take..]);
    out
}

fn xor(a: &Whitening, b: &Whitening) -> Whitening {
    let mut out = [0u8; WHITENING_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = a[i] ^ b[i];
    }
    out
}

/// Median of a sorted sample list: middle element for odd counts, mean of
/// the two middle elements for even counts.
fn median(sorted: &[Timestamp]) -> Timestamp {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        0.5 * (sorted[n / 2] + sorted[(n - 1) / 2])
    } else {
        sorted[n / 2]
    }
}

impl Graph {
    /// Assign round-received and consensus timestamps for each newly decided
    /// consensus round, then emit the round's transactions in final order.
    ///
    /// Returns the state-signature transactions encountered in remote
    /// payloads; the checkpoint manager consumes them after the sweep.
    pub fn find_order(&mut self, new_c: &[Round]) -> Result<Vec<StateSignatureTx>, PrismaError> {
        let mut collected_signs = Vec::new();

        for &r in new_c {
            let witnesses = self.store.get_witness(r)?;
            let mut famous: Vec<EventId> = Vec::new();
            for w in witnesses.values() {
                if self.store.get_famous(w)? == Some(true) {
                    famous.push(w.clone());
                }
            }

            let mut whitening = [0u8; WHITENING_LEN];
            for w in &famous {
                if let Some(ev) = self.store.get_event(w)? {
                    whitening = xor(&whitening, &sig_whitening(&ev.s));
                }
            }

            // Walk backwards from the famous witnesses, never leaving the
            // undecided set.
            let start: Vec<EventId> = famous
                .iter()
                .filter(|w| self.tbd.contains(*w))
                .cloned()
                .collect();
            let reachable = bfs(start, |u| {
                let mut next = Vec::new();
                if let Ok(Some(ev)) = self.store.get_event(u) {
                    for p in self.live_parents(&ev).unwrap_or_default() {
                        if self.tbd.contains(&p) {
                            next.push(p);
                        }
                    }
                }
                next
            });

            let mut timestamps: HashMap<EventId, Timestamp> = HashMap::new();
            let mut decided: Vec<EventId> = Vec::new();

            for x in reachable {
                let Some(ev) = self.store.get_event(&x)? else {
                    continue;
                };
                let creator = ev.c.clone();

                // Famous witnesses that see x through the creator's column.
                let mut seen_by: BTreeSet<EventId> = BTreeSet::new();
                for w in &famous {
                    let can_see_w = self.store.get_can_see(w)?;
                    if self.higher(can_see_w.get(&creator), Some(&x)) {
                        seen_by.insert(w.clone());
                    }
                }

                if seen_by.len() as u64 * 2 <= self.total_stake {
                    continue;
                }
                self.tbd.remove(&x);
                decided.push(x.clone());

                // Sample, per witness, the oldest self-ancestor that still
                // sees x; the median of those times is the consensus time.
                let mut times: Vec<Timestamp> = Vec::new();
                for w in &seen_by {
                    let a = self.oldest_seeing_ancestor(w, &creator, &x)?;
                    if let Some(ev_a) = self.store.get_event(&a)? {
                        times.push(ev_a.t);
                    }
                }
                times.sort_by(|a, b| a.total_cmp(b));
                timestamps.insert(x, median(&times));
            }

            decided.sort_by(|a, b| {
                let ta = timestamps[a];
                let tb = timestamps[b];
                ta.total_cmp(&tb).then_with(|| {
                    let wa = self.whitened_id(a, &whitening);
                    let wb = self.whitened_id(b, &whitening);
                    wa.cmp(&wb)
                })
            });
            debug!(round = r, events = decided.len(), "final order for round");

            collected_signs.extend(self.insert_processed_transactions(&decided, r)?);
        }
        Ok(collected_signs)
    }

    /// Descend the self-parent chain from `w` while the ancestor still sees
    /// `x` through `creator`'s column; the last one that does is the sample.
    fn oldest_seeing_ancestor(
        &self,
        w: &EventId,
        creator: &str,
        x: &EventId,
    ) -> Result<EventId, PrismaError> {
        let mut a = w.clone();
        loop {
            let Some(ev_a) = self.store.get_event(&a)? else {
                return Ok(a);
            };
            let Some(parent) = self.live_parents(&ev_a)?.first().cloned() else {
                return Ok(a);
            };
            let parent_sees = {
                let can_see_p = self.store.get_can_see(&parent)?;
                self.higher(can_see_p.get(creator), Some(x))
            };
            if !parent_sees {
                return Ok(a);
            }
            a = parent;
        }
    }

    fn whitened_id(&self, id: &EventId, whitening: &Whitening) -> Whitening {
        let sig = self
            .store
            .get_event(id)
            .ok()
            .flatten()
            .map(|ev| sig_whitening(&ev.s))
            .unwrap_or([0u8; WHITENING_LEN]);
        xor(whitening, &sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_odd_takes_middle_sample() {
        // The middle value itself, not half of it.
        assert_eq!(median(&[1.0, 5.0, 9.0]), 5.0);
        assert_eq!(median(&[7.0]), 7.0);
    }

    #[test]
    fn median_even_averages_middles() {
        assert_eq!(median(&[1.0, 3.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 4.0, 8.0]), 3.0);
    }

    #[test]
    fn whitening_xor_is_self_inverse() {
        let a = sig_whitening(&"ab".repeat(64));
        let b = sig_whitening(&"cd".repeat(64));
        assert_eq!(xor(&xor(&a, &b), &b), a);
    }

    #[test]
    fn whitening_orders_like_integers() {
        // "0a" < "0b" as hex strings and as big-endian integers alike.
        let lo = sig_whitening("0a");
        let hi = sig_whitening("0b");
        assert!(lo < hi);
    }
}

use std::collections::BTreeSet;

use tracing::debug;

use prisma_core::constants::COIN_ROUND_PERIOD;
use prisma_core::error::PrismaError;
use prisma_core::types::{EventId, Round};

use crate::graph::Graph;

/// Majority over weighted ballots: returns the winning vote and its tally.
/// Ties go to true.
fn majority(ballots: impl IntoIterator<Item = (u64, bool)>) -> (bool, u64) {
    let mut hits = [0u64, 0u64];
    for (weight, vote) in ballots {
        hits[vote as usize] += weight;
    }
    if hits[0] > hits[1] {
        (false, hits[0])
    } else {
        (true, hits[1])
    }
}

impl Graph {
    /// Run the virtual-voting election over every undecided witness.
    ///
    /// Voters are the witnesses of rounds above the last decided consensus
    /// round, processed in ascending order; subjects are earlier-round
    /// witnesses without a fame decision. Returns the newly decided
    /// consensus rounds, ascending.
    pub fn decide_fame(&mut self) -> Result<Vec<Round>, PrismaError> {
        let max_r = self.store.get_witness_max_round()?;
        let max_c = self.store.get_last_consensus()?;
        debug!(max_r, max_c, "decide_fame sweep");

        let mut done: BTreeSet<Round> = BTreeSet::new();

        for r_voter in (max_c + 1)..=max_r {
            let voters: Vec<EventId> =
                self.store.get_witness(r_voter)?.values().cloned().collect();
            for y in voters {
                // Witnesses of the previous round this voter strongly sees;
                // their recorded ballots drive every election it joins.
                let prev_witnesses = self.store.get_witness(r_voter - 1)?;
                let s: BTreeSet<EventId> = self
                    .strongly_see(&y, r_voter - 1)?
                    .into_iter()
                    .filter_map(|c| prev_witnesses.get(&c).cloned())
                    .collect();

                for r_subject in max_c..r_voter {
                    if self.store.check_consensus(r_subject) {
                        continue;
                    }
                    let subjects: Vec<EventId> =
                        self.store.get_witness(r_subject)?.values().cloned().collect();
                    for x in subjects {
                        if self.store.check_famous(&x) {
                            continue;
                        }
                        let diff = r_voter - r_subject;

                        if diff == 1 {
                            // First round of the election: vote visibility.
                            self.store.insert_vote(&y, &x, s.contains(&x))?;
                            continue;
                        }

                        // Each ballot carries the weight of the voter's whole
                        // strongly-seen set: one witness that strongly sees a
                        // supermajority is enough to close an election.
                        let weight = s.len() as u64;
                        let mut ballots = Vec::new();
                        for w in &s {
                            if let Some(vote) = self.store.get_votes(w)?.get(&x) {
                                ballots.push((weight, *vote));
                            }
                        }
                        let (v, t) = majority(ballots);

                        if diff % COIN_ROUND_PERIOD != 0 {
                            if t >= self.min_stake {
                                self.store.insert_famous(&x, v)?;
                                done.insert(r_subject);
                                debug!(witness = %x, famous = v, round = r_subject, "fame decided");
                            } else {
                                self.store.insert_vote(&y, &x, v)?;
                            }
                        } else {
                            // Coin round: a supermajority still just votes;
                            // a deadlock is broken by the voter's signature.
                            if t >= self.min_stake {
                                self.store.insert_vote(&y, &x, v)?;
                            } else {
                                let coin = self.coin_flip(&y)?;
                                self.store.insert_vote(&y, &x, coin)?;
                                debug!(voter = %y, subject = %x, coin, "coin round flip");
                            }
                        }
                    }
                }
            }
        }

        // A round reaches consensus only once every one of its witnesses has
        // a fame decision.
        let mut new_consensus = Vec::new();
        for r in done {
            let witnesses = self.store.get_witness(r)?;
            if witnesses.values().all(|w| self.store.check_famous(w)) {
                new_consensus.push(r);
            }
        }
        self.store.insert_consensus(&new_consensus, false)?;
        debug!(?new_consensus, "new consensus rounds");
        Ok(new_consensus)
    }

    /// Low bit of the first byte of the voter's signature.
    fn coin_flip(&self, voter: &EventId) -> Result<bool, PrismaError> {
        let ev = self
            .store
            .get_event(voter)?
            .ok_or_else(|| PrismaError::ParentMissing(voter.clone()))?;
        Ok(ev.s.as_bytes().first().map(|b| b & 1 == 1).unwrap_or(false))
    }
}

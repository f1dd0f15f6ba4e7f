//! Prisma protocol constants.
//!
//! Consensus parameters are fixed for the whole network: changing any of them
//! forks the total order.

use crate::types::{Round, Stake};

// ── Consensus ────────────────────────────────────────────────────────────────

/// Default total voting stake of the network (per-node stake is 1).
/// Overridable at startup; dynamic stake is out of scope.
pub const DEFAULT_TOTAL_STAKE: Stake = 4;

/// Every C-th round of a fame election is a coin round.
pub const COIN_ROUND_PERIOD: Round = 6;

/// Number of decided consensus rounds folded into one signed state.
pub const STATE_ROUND_STRIDE: Round = 10;

/// Round of the genesis state.
pub const GENESIS_ROUND: Round = -1;

/// Supermajority threshold: floor(2·total/3) + 1.
pub fn min_stake(total_stake: Stake) -> Stake {
    2 * total_stake / 3 + 1
}

// ── Transactions ─────────────────────────────────────────────────────────────

/// Largest transferable amount in a single transaction.
pub const MAX_TRANSFER_AMOUNT: i64 = i64::MAX;

/// Length of a hex-encoded Ed25519 verify key.
pub const VERIFY_KEY_HEX_LEN: usize = 64;

/// Wallet address suffix.
pub const ADDRESS_SUFFIX: &str = "PR";

// ── Wire protocol ────────────────────────────────────────────────────────────

/// Upper bound for a single frame: both the decimal length prefix and the
/// compressed payload must stay below this.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Default zlib compression level for frames.
pub const DEFAULT_ZLIB_LEVEL: u32 = 6;

/// Default deadline for one peer exchange, seconds.
pub const DEFAULT_PEER_TIMEOUT_SECS: u64 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supermajority_of_four_is_three() {
        assert_eq!(min_stake(4), 3);
    }

    #[test]
    fn supermajority_grows_with_stake() {
        assert_eq!(min_stake(3), 3);
        assert_eq!(min_stake(6), 5);
        assert_eq!(min_stake(7), 5);
        assert_eq!(min_stake(9), 7);
    }
}

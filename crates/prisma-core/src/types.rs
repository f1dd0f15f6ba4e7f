/// BLAKE2b event hash, 64 lowercase hex characters. Used as the primary key
/// for every DAG collection and carried verbatim on the wire.
pub type EventId = String;

/// Hex-encoded Ed25519 verify key (64 hex characters). Identifies an event
/// creator; one consensus participant per key.
pub type VerifyKeyHex = String;

/// Wallet address: decimal rendering of the first 8 ASCII bytes of the
/// hex-encoded public key, big-endian, followed by the `PR` suffix.
pub type Address = String;

/// Consensus round label. Rounds start at 0 for root events; the genesis
/// state sits at round -1.
pub type Round = i64;

/// Event height: 0 for roots, 1 + max(parent heights) otherwise.
pub type Height = u64;

/// Event creation time, seconds since the Unix epoch (creator-supplied).
pub type Timestamp = f64;

/// Transfer amounts and wallet balances. Amounts are validated into
/// [1, i64::MAX]; balances are deltas over states and can be summed safely.
pub type Amount = i64;

/// Voting weight. Per-node stake is fixed at 1; the total is a startup
/// parameter of the network.
pub type Stake = u64;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrismaError {
    // ── Event validation ─────────────────────────────────────────────────────
    #[error("invalid signature")]
    InvalidSignature,

    #[error("event hash mismatch for {0}")]
    HashMismatch(String),

    #[error("parent event missing: {0}")]
    ParentMissing(String),

    #[error("self-parent forked or wrong creator for event {0}")]
    SelfParentForked(String),

    // ── Transactions ─────────────────────────────────────────────────────────
    #[error("insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: i64, have: i64 },

    #[error("malformed wallet address: {0}")]
    MalformedAddress(String),

    #[error("transaction amount out of range")]
    InvalidAmount,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("unknown transaction type: {0}")]
    UnknownTxType(i64),

    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    // ── Signed states ────────────────────────────────────────────────────────
    #[error("not enough decided rounds: have {have}, need {need}")]
    NotEnoughRounds { have: usize, need: usize },

    #[error("not enough state signatures: have {have}, need {need}")]
    NotEnoughSignatures { have: usize, need: usize },

    #[error("state chain broken at round {0}")]
    StateChainBroken(i64),

    // ── Wire protocol ────────────────────────────────────────────────────────
    #[error("frame exceeds maximum length: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown wire method")]
    UnknownMethod,

    #[error("peer error: {0}")]
    Peer(String),

    #[error("connected to myself")]
    SelfConnection,

    // ── Wallet / genesis ─────────────────────────────────────────────────────
    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("genesis error: {0}")]
    Genesis(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrismaError {
    /// Storage faults may leave the DAG collections half-written and must
    /// terminate the engine; everything else is recoverable by discarding
    /// the offending datum.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PrismaError::Storage(_))
    }
}

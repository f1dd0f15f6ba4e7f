pub mod db;
pub mod records;

pub use db::StoreDb;
pub use records::{
    PeerInfo, SignatureEntry, State, StateSignatures, StoredState, StoredTransaction,
};

pub mod hash;
pub mod keypair;
pub mod wallet;

pub use hash::{address_from_verify_key, hash_event, hash_tx, tx_id};
pub use keypair::{verify_attached, verify_detached, KeyPair, SignedData};
pub use wallet::WalletKeys;

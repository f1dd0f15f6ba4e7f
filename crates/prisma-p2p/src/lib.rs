pub mod framing;
pub mod message;
pub mod peers;
pub mod service;

pub use message::WireMessage;
pub use service::{NetworkConfig, NetworkService};

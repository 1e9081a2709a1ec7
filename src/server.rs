//! Services answering other nodes: announce tokens and announced peers.

pub mod peers;
pub mod tokens;

pub use peers::PeerAnnounceStorage;
pub use tokens::TokenTracker;

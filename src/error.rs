//! Main Crate Error

use std::net::SocketAddr;

use crate::common::Family;

#[derive(thiserror::Error, Debug)]
/// dhtboot crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Indicates that a node id is not 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// A datagram that is valid bencode but not a KRPC message we understand.
    #[error("Invalid KRPC message: {0}")]
    InvalidMessage(&'static str),

    /// Malformed compact node info or peer address.
    #[error("Invalid compact encoding: {0}")]
    Compact(&'static str),

    /// The persisted routing table could not be used.
    #[error("Invalid DHT state file: {0}")]
    StateFile(&'static str),

    /// None of the candidate ports could be bound.
    #[error("Error occurred while binding UDP port for DHT, tried {0} candidate port(s)")]
    PortsExhausted(usize),

    /// Malformed listen port option, like `6881-`.
    #[error("Invalid port segments: {0:?}")]
    InvalidPortSegments(String),

    /// A back-reference was injected twice.
    #[error("{0} is already wired")]
    AlreadyWired(&'static str),

    /// A back-reference was never injected.
    #[error("{0} is not wired")]
    NotWired(&'static str),

    /// The per-family registry slot is not in the state the transition expects.
    #[error("DHT registry slot for {family}: {reason}")]
    Registry {
        family: Family,
        reason: &'static str,
    },

    /// The address does not belong to the family of this DHT stack.
    #[error("Address {0} does not match the DHT address family")]
    UnsupportedAddress(SocketAddr),
}

/// Alias for `Result<T, dhtboot::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

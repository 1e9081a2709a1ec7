//! Announce tokens handed out in `get_peers` responses.
//!
//! A token binds an info hash to the address that asked for it, and stays
//! valid until the secret has been rotated twice.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::Instant;

use crc::{Crc, CRC_32_ISCSI};
use rand::Rng;
use tracing::trace;

use crate::common::{address_to_compact, Id};

const SECRET_SIZE: usize = 4;
pub const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

type Secret = [u8; SECRET_SIZE];

/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
pub struct TokenTracker {
    /// Current secret first.
    secrets: [Secret; 2],
    last_updated: Instant,
}

impl Debug for TokenTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenTracker")
            .field("last_updated", &self.last_updated)
            .finish_non_exhaustive()
    }
}

impl TokenTracker {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        TokenTracker {
            secrets: [rng.gen(), rng.gen()],
            last_updated: Instant::now(),
        }
    }

    /// When the secret was last rotated.
    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    /// The token `peer` has to present to announce itself for `info_hash`.
    pub fn generate_token(&self, info_hash: &Id, peer: SocketAddr) -> [u8; TOKEN_SIZE] {
        token(info_hash, peer, &self.secrets[0])
    }

    /// Accepts tokens generated from the current or the previous secret.
    pub fn validate(&self, info_hash: &Id, peer: SocketAddr, token: &[u8]) -> bool {
        self.secrets
            .iter()
            .any(|secret| self::token(info_hash, peer, secret) == token)
    }

    pub fn update_token_secret(&mut self) {
        trace!("Rotating announce token secret");

        self.secrets[1] = self.secrets[0];
        self.secrets[0] = rand::thread_rng().gen();
        self.last_updated = Instant::now();
    }
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-32C of the info hash, the compact peer address and the secret.
fn token(info_hash: &Id, peer: SocketAddr, secret: &Secret) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();
    digest.update(info_hash.as_bytes());
    digest.update(&address_to_compact(&peer));
    digest.update(secret);

    digest.finalize().to_be_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_is_bound_to_info_hash_and_peer() {
        let tracker = TokenTracker::new();
        let info_hash = Id::random();
        let peer: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let token = tracker.generate_token(&info_hash, peer);

        assert!(tracker.validate(&info_hash, peer, &token));
        assert!(!tracker.validate(&Id::random(), peer, &token));
        assert!(!tracker.validate(&info_hash, "127.0.0.2:6881".parse().unwrap(), &token));
        assert!(!tracker.validate(&info_hash, peer, &token[..2]));
    }

    #[test]
    fn ipv6_peers() {
        let tracker = TokenTracker::new();
        let info_hash = Id::random();
        let peer: SocketAddr = "[2001:db8::1]:6881".parse().unwrap();

        let token = tracker.generate_token(&info_hash, peer);

        assert!(tracker.validate(&info_hash, peer, &token));
    }

    #[test]
    fn expires_after_two_rotations() {
        let mut tracker = TokenTracker::new();
        let info_hash = Id::random();
        let peer: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let token = tracker.generate_token(&info_hash, peer);

        tracker.update_token_secret();
        assert!(tracker.validate(&info_hash, peer, &token));

        tracker.update_token_secret();
        assert!(!tracker.validate(&info_hash, peer, &token));
    }
}

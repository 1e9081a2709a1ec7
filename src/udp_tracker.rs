//! UDP tracker client handle sharing the IPv4 DHT socket.
//!
//! Only the bookkeeping the DHT interaction loop needs: pending transaction
//! ids, and claiming tracker replies that arrive on the DHT socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Tracker replies not received within this window are dropped.
pub const UDP_TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

const ACTION_ERROR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    to: SocketAddr,
    sent_at: Instant,
}

#[derive(Debug, Default)]
pub struct UdpTrackerClient {
    pending: HashMap<u32, PendingRequest>,
    replies: usize,
}

impl UdpTrackerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request sent to a tracker, expecting a reply with the same transaction id.
    pub fn add_request(&mut self, transaction_id: u32, to: SocketAddr) {
        self.pending.insert(
            transaction_id,
            PendingRequest {
                to,
                sent_at: Instant::now(),
            },
        );
    }

    /// Claims a non-DHT datagram if it answers one of our pending requests.
    pub fn receive_reply(&mut self, bytes: &[u8], from: SocketAddr) -> bool {
        if bytes.len() < 8 {
            trace!(?from, size = bytes.len(), "Datagram too short for a tracker reply");
            return false;
        }

        let action = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let transaction_id = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        match self.pending.get(&transaction_id) {
            Some(request) if request.to == from => {
                self.pending.remove(&transaction_id);
                self.replies += 1;

                if action == ACTION_ERROR {
                    debug!(
                        ?from,
                        message = %String::from_utf8_lossy(&bytes[8..]),
                        "UDP tracker returned an error"
                    );
                }
                true
            }
            _ => false,
        }
    }

    pub fn handle_timeout(&mut self) {
        self.handle_timeout_at(Instant::now())
    }

    fn handle_timeout_at(&mut self, now: Instant) {
        self.pending
            .retain(|_, request| now.saturating_duration_since(request.sent_at) < UDP_TRACKER_TIMEOUT);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of replies claimed so far.
    pub fn reply_count(&self) -> usize {
        self.replies
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reply(action: u32, transaction_id: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&action.to_be_bytes());
        bytes.extend_from_slice(&transaction_id.to_be_bytes());
        bytes.extend_from_slice(&[0; 8]);
        bytes
    }

    #[test]
    fn claims_matching_reply() {
        let tracker: SocketAddr = ([10, 0, 0, 1], 6969).into();
        let mut client = UdpTrackerClient::new();
        client.add_request(42, tracker);

        assert!(!client.receive_reply(&reply(0, 41), tracker));
        assert!(!client.receive_reply(&reply(0, 42), ([10, 0, 0, 2], 6969).into()));
        assert!(!client.receive_reply(&[0, 0, 0], tracker));

        assert!(client.receive_reply(&reply(0, 42), tracker));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.reply_count(), 1);

        assert!(!client.receive_reply(&reply(0, 42), tracker));
    }

    #[test]
    fn drops_stale_requests() {
        let mut client = UdpTrackerClient::new();
        client.add_request(1, ([10, 0, 0, 1], 6969).into());

        client.handle_timeout();
        assert_eq!(client.pending_count(), 1);

        client.handle_timeout_at(Instant::now() + UDP_TRACKER_TIMEOUT);
        assert_eq!(client.pending_count(), 0);
    }
}

//! Correlates responses with the queries we sent.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{lock, Id, Link, Shared};
use crate::routing_table::RoutingTable;
use crate::Result;

#[derive(Debug, Clone)]
pub struct TrackerEntry {
    pub transaction_id: u16,
    pub to: SocketAddr,
    /// The id of the queried node, unknown for entry points.
    pub remote_id: Option<Id>,
    pub method: &'static str,
    pub sent_at: Instant,
    pub timeout: Duration,
}

impl TrackerEntry {
    pub fn does_match(&self, from: &SocketAddr, transaction_id: u16) -> bool {
        if self.transaction_id != transaction_id {
            return false;
        }

        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }

    fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) >= self.timeout
    }
}

#[derive(Debug)]
/// Inflight queries of one stack.
pub struct MessageTracker {
    entries: Vec<TrackerEntry>,

    routing_table: Link<Mutex<RoutingTable>>,
}

impl MessageTracker {
    pub fn new() -> Self {
        MessageTracker {
            entries: Vec::new(),
            routing_table: Link::new("message_tracker.routing_table"),
        }
    }

    // === Wiring ===

    pub fn wire_routing_table(&self, routing_table: &Shared<RoutingTable>) -> Result<()> {
        self.routing_table.wire(routing_table)
    }

    pub fn ensure_wired(&self) -> Result<()> {
        self.routing_table.ensure_wired()
    }

    // === Public Methods ===

    pub fn add_message(&mut self, entry: TrackerEntry) {
        self.entries.push(entry);
    }

    /// Removes and returns the inflight query answered by a message from `from`.
    pub fn message_arrived(&mut self, transaction_id: u16, from: &SocketAddr) -> Option<TrackerEntry> {
        match self
            .entries
            .iter()
            .position(|entry| entry.does_match(from, transaction_id))
        {
            Some(index) => Some(self.entries.remove(index)),
            None => {
                trace!(transaction_id, ?from, "Unexpected response");
                None
            }
        }
    }

    /// Drops expired queries and evicts the nodes that never answered.
    pub fn handle_timeout(&mut self) -> Vec<TrackerEntry> {
        self.handle_timeout_at(Instant::now())
    }

    fn handle_timeout_at(&mut self, now: Instant) -> Vec<TrackerEntry> {
        let (expired, pending): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|entry| entry.is_timed_out(now));
        self.entries = pending;

        if expired.is_empty() {
            return expired;
        }

        if let Some(routing_table) = self.routing_table.get() {
            let mut routing_table = lock(&routing_table);
            for entry in &expired {
                if let Some(id) = &entry.remote_id {
                    if routing_table.remove(id) {
                        debug!(?id, address = ?entry.to, method = entry.method, "Evicted unresponsive node");
                    }
                }
            }
        }

        expired
    }

    /// Number of inflight queries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for MessageTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::common::{Family, LocalNode, Node};

    fn entry(transaction_id: u16, to: &str, remote_id: Option<Id>) -> TrackerEntry {
        TrackerEntry {
            transaction_id,
            to: to.parse().unwrap(),
            remote_id,
            method: "ping",
            sent_at: Instant::now(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn matches_transaction_and_address() {
        let mut tracker = MessageTracker::new();
        tracker.add_message(entry(1, "1.1.1.1:1000", None));

        assert!(tracker
            .message_arrived(1, &"2.2.2.2:1000".parse().unwrap())
            .is_none());
        assert!(tracker
            .message_arrived(2, &"1.1.1.1:1000".parse().unwrap())
            .is_none());
        assert!(tracker
            .message_arrived(1, &"1.1.1.1:1000".parse().unwrap())
            .is_some());
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn timeout_evicts_silent_node() {
        let local = LocalNode::new();
        let routing_table = Arc::new(Mutex::new(RoutingTable::new(Family::Ipv4, &local)));
        let silent = Node::new(local.id().random_at_distance(150), "1.1.1.1:1000".parse().unwrap());
        lock(&routing_table).add(silent.clone());

        let mut tracker = MessageTracker::new();
        tracker.wire_routing_table(&routing_table).unwrap();
        tracker.add_message(entry(1, "1.1.1.1:1000", Some(silent.id)));
        tracker.add_message(entry(2, "3.3.3.3:1000", None));

        let later = Instant::now() + Duration::from_secs(11);
        let expired = tracker.handle_timeout_at(later);

        assert_eq!(expired.len(), 2);
        assert_eq!(tracker.count(), 0);
        assert!(!lock(&routing_table).contains(silent.id()));
    }
}

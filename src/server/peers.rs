//! Manage announced peers for info_hashes

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::common::{lock, Id, Link, Shared};
use crate::tasks::{TaskFactory, TaskQueue};
use crate::Result;

/// Announced peers are forgotten after this long without a re-announce.
pub const DHT_PEER_ANNOUNCE_PURGE_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Maximum peers returned in one get_peers response.
pub const MAX_PEERS_PER_RESPONSE: usize = 50;

const MAX_INFO_HASHES: NonZeroUsize = match NonZeroUsize::new(2000) {
    Some(n) => n,
    None => unreachable!(),
};
const MAX_PEERS: NonZeroUsize = match NonZeroUsize::new(500) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Debug)]
/// An LRU cache of "Peers" per info hashes, each stamped with its announce time.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
pub struct PeerAnnounceStorage {
    info_hashes: LruCache<Id, LruCache<SocketAddr, Instant>>,
    max_peers: NonZeroUsize,
    /// Info hashes this node downloads, and looks up peers for.
    local: HashSet<Id>,

    task_queue: Link<Mutex<TaskQueue>>,
    task_factory: Link<TaskFactory>,
}

impl PeerAnnounceStorage {
    pub fn new() -> Self {
        Self::with_capacity(MAX_INFO_HASHES, MAX_PEERS)
    }

    pub fn with_capacity(max_info_hashes: NonZeroUsize, max_peers: NonZeroUsize) -> Self {
        Self {
            info_hashes: LruCache::new(max_info_hashes),
            max_peers,
            local: HashSet::new(),
            task_queue: Link::new("peer_announce_storage.task_queue"),
            task_factory: Link::new("peer_announce_storage.task_factory"),
        }
    }

    // === Wiring ===

    pub fn wire_task_queue(&self, task_queue: &Shared<TaskQueue>) -> Result<()> {
        self.task_queue.wire(task_queue)
    }

    pub fn wire_task_factory(&self, task_factory: &Arc<TaskFactory>) -> Result<()> {
        self.task_factory.wire(task_factory)
    }

    pub fn ensure_wired(&self) -> Result<()> {
        self.task_queue.ensure_wired()?;
        self.task_factory.ensure_wired()
    }

    // === Public Methods ===

    pub fn add_peer(&mut self, info_hash: Id, peer: SocketAddr) {
        let now = Instant::now();

        if let Some(info_hash_lru) = self.info_hashes.get_mut(&info_hash) {
            info_hash_lru.put(peer, now);
        } else {
            let mut info_hash_lru = LruCache::new(self.max_peers);
            info_hash_lru.put(peer, now);
            self.info_hashes.put(info_hash, info_hash_lru);
        };
    }

    /// Most recently announced peers of an info hash.
    pub fn get_peers(&mut self, info_hash: &Id) -> Vec<SocketAddr> {
        self.info_hashes
            .get(info_hash)
            .map(|peers| {
                peers
                    .iter()
                    .take(MAX_PEERS_PER_RESPONSE)
                    .map(|(peer, _)| *peer)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forgets peers that did not re-announce within [DHT_PEER_ANNOUNCE_PURGE_INTERVAL].
    pub fn handle_timeout(&mut self) {
        self.handle_timeout_at(Instant::now())
    }

    fn handle_timeout_at(&mut self, now: Instant) {
        let mut emptied = Vec::new();
        let mut purged = 0;

        for (info_hash, peers) in self.info_hashes.iter_mut() {
            let expired: Vec<SocketAddr> = peers
                .iter()
                .filter(|(_, announced_at)| {
                    now.saturating_duration_since(**announced_at) >= DHT_PEER_ANNOUNCE_PURGE_INTERVAL
                })
                .map(|(peer, _)| *peer)
                .collect();

            purged += expired.len();
            for peer in expired {
                peers.pop(&peer);
            }
            if peers.is_empty() {
                emptied.push(*info_hash);
            }
        }

        for info_hash in emptied {
            self.info_hashes.pop(&info_hash);
        }

        if purged > 0 {
            debug!(purged, "Purged expired peer announces");
        }
    }

    /// Registers an info hash we download and schedules a peer lookup for it.
    pub fn add_local(&mut self, info_hash: Id) -> Result<()> {
        self.local.insert(info_hash);

        let task = self.task_factory.require()?.create_peer_lookup_task(info_hash);
        lock(&*self.task_queue.require()?).add_periodic_task2(task);

        Ok(())
    }

    pub fn is_local(&self, info_hash: &Id) -> bool {
        self.local.contains(info_hash)
    }

    pub fn info_hash_count(&self) -> usize {
        self.info_hashes.len()
    }

    pub fn peer_count(&self) -> usize {
        self.info_hashes.iter().map(|(_, peers)| peers.len()).sum()
    }
}

impl Default for PeerAnnounceStorage {
    fn default() -> Self {
        Self::new()
    }
}

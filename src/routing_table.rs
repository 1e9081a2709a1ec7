//! Simplified Kademlia routing table

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{lock, Family, Id, Link, LocalNode, Node, Shared};
use crate::tasks::{TaskFactory, TaskQueue};
use crate::Result;

/// K = the maximum size of a k-bucket.
pub const BUCKET_SIZE_K: usize = 8;
/// Maximum number of replacement candidates remembered per bucket.
pub const MAX_CACHED_NODES: usize = 8;

#[derive(Debug)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    family: Family,
    buckets: BTreeMap<u8, KBucket>,

    task_queue: Link<Mutex<TaskQueue>>,
    task_factory: Link<TaskFactory>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] around the local node.
    pub fn new(family: Family, local_node: &LocalNode) -> Self {
        RoutingTable {
            id: *local_node.id(),
            family,
            buckets: BTreeMap::new(),
            task_queue: Link::new("routing_table.task_queue"),
            task_factory: Link::new("routing_table.task_factory"),
        }
    }

    // === Wiring ===

    pub fn wire_task_queue(&self, task_queue: &Shared<TaskQueue>) -> Result<()> {
        self.task_queue.wire(task_queue)
    }

    pub fn wire_task_factory(&self, task_factory: &std::sync::Arc<TaskFactory>) -> Result<()> {
        self.task_factory.wire(task_factory)
    }

    pub fn ensure_wired(&self) -> Result<()> {
        self.task_queue.ensure_wired()?;
        self.task_factory.ensure_wired()
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn family(&self) -> Family {
        self.family
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing table, and return `true` if it did.
    ///
    /// A node that is already known is moved to the most recently seen end of
    /// its bucket. If the bucket is full, the node is cached as a replacement
    /// and the least recently seen node gets pinged.
    pub fn add(&mut self, node: Node) -> bool {
        if !self.family.matches(&node.address) {
            trace!(?node, "Ignoring node of the other address family");
            return false;
        }

        let distance = self.id.distance(node.id());

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        let bucket = self.buckets.entry(distance).or_default();

        if bucket.refresh(&node) {
            return true;
        }

        if bucket.nodes.len() < BUCKET_SIZE_K {
            bucket.nodes.push(node);
            bucket.touch();
            return true;
        }

        let oldest = bucket.nodes[0].clone();
        bucket.cache(node);
        self.replace_node(oldest);

        false
    }

    /// Remove a node from this routing table, promoting a cached replacement.
    pub fn remove(&mut self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        match self.buckets.get_mut(&distance) {
            Some(bucket) => {
                let removed = bucket.remove(node_id);
                if bucket.nodes.is_empty() && bucket.cached.is_empty() {
                    self.buckets.remove(&distance);
                }
                removed
            }
            None => false,
        }
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.nodes.iter().any(|node| node.id() == node_id))
            .unwrap_or(false)
    }

    /// Return up to [BUCKET_SIZE_K] nodes closest to the target.
    pub fn closest(&self, target: &Id) -> Vec<Node> {
        let mut nodes = self.nodes();
        nodes.sort_by_key(|node| node.id().xor(target));
        nodes.truncate(BUCKET_SIZE_K);

        nodes
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.nodes.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.nodes.iter().cloned())
            .collect()
    }

    /// Distances of all non empty buckets.
    pub fn distances(&self) -> Vec<u8> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.nodes.is_empty())
            .map(|(distance, _)| *distance)
            .collect()
    }

    /// Distances of the buckets that were not touched within `interval`.
    pub fn buckets_to_refresh(&self, interval: Duration) -> Vec<u8> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| bucket.last_touched.elapsed() >= interval)
            .map(|(distance, _)| *distance)
            .collect()
    }

    /// Marks the bucket at `distance` as recently refreshed.
    pub fn touch(&mut self, distance: u8) {
        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.touch();
        }
    }

    // === Private Methods ===

    fn replace_node(&self, oldest: Node) {
        let (Some(task_queue), Some(task_factory)) = (self.task_queue.get(), self.task_factory.get())
        else {
            debug!(?oldest, "Bucket is full but the task queue is gone");
            return;
        };

        let task = task_factory.create_ping_task(oldest.address, Some(oldest.id));
        lock(&task_queue).add_immediate_task(task);
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug)]
struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
    /// Replacement candidates, most recent last.
    cached: VecDeque<Node>,
    last_touched: Instant,
}

impl KBucket {
    fn new() -> Self {
        KBucket {
            nodes: Vec::with_capacity(BUCKET_SIZE_K),
            cached: VecDeque::new(),
            last_touched: Instant::now(),
        }
    }

    /// Moves a known node to the most recently seen end.
    fn refresh(&mut self, node: &Node) -> bool {
        match self.nodes.iter().position(|n| n.id() == node.id()) {
            Some(index) => {
                self.nodes.remove(index);
                self.nodes.push(node.clone());
                self.touch();
                true
            }
            None => false,
        }
    }

    fn cache(&mut self, node: Node) {
        self.cached.retain(|cached| cached.id() != node.id());
        if self.cached.len() >= MAX_CACHED_NODES {
            self.cached.pop_front();
        }
        self.cached.push_back(node);
    }

    fn remove(&mut self, node_id: &Id) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.id() != node_id);

        if self.nodes.len() == before {
            return false;
        }

        if let Some(replacement) = self.cached.pop_back() {
            self.nodes.push(replacement);
        }

        true
    }

    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::new(Family::Ipv4, &LocalNode::new())
    }

    fn node_at(table: &RoutingTable, distance: u8, port: u16) -> Node {
        let address: SocketAddr = ([10, 0, 0, 1], port).into();
        Node::new(table.id().random_at_distance(distance), address)
    }

    #[test]
    fn table_is_empty() {
        let mut table = table();
        assert!(table.is_empty());

        let node = node_at(&table, 100, 1);
        assert!(table.add(node));
        assert!(!table.is_empty());
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = table();
        let node = Node::new(*table.id(), "1.1.1.1:1".parse().unwrap());

        assert!(!table.add(node));
        assert!(table.is_empty())
    }

    #[test]
    fn should_not_add_other_family() {
        let mut table = table();
        let node = Node::new(Id::random(), "[::1]:6881".parse().unwrap());

        assert!(!table.add(node));
        assert!(table.is_empty())
    }

    #[test]
    fn known_node_is_refreshed_not_duplicated() {
        let mut table = table();
        let node = node_at(&table, 150, 1);

        assert!(table.add(node.clone()));
        assert!(table.add(node.clone()));
        assert_eq!(table.size(), 1);
        assert!(table.contains(node.id()));
    }

    #[test]
    fn full_bucket_caches_replacement() {
        let mut table = table();
        let nodes: Vec<Node> = (0..BUCKET_SIZE_K as u16)
            .map(|port| node_at(&table, 160, port))
            .collect();
        for node in &nodes {
            table.add(node.clone());
        }

        let extra = node_at(&table, 160, 1000);
        assert!(!table.add(extra.clone()));
        assert_eq!(table.size(), BUCKET_SIZE_K);
        assert!(!table.contains(extra.id()));

        // Evicting the oldest node promotes the cached one.
        assert!(table.remove(nodes[0].id()));
        assert!(table.contains(extra.id()));
        assert_eq!(table.size(), BUCKET_SIZE_K);
    }

    #[test]
    fn full_bucket_schedules_ping_of_oldest() {
        let mut table = table();
        let task_queue = Arc::new(Mutex::new(TaskQueue::new()));
        let task_factory = Arc::new(TaskFactory::new(Duration::from_secs(10)));
        table.wire_task_queue(&task_queue).unwrap();
        table.wire_task_factory(&task_factory).unwrap();

        for port in 0..=BUCKET_SIZE_K as u16 {
            table.add(node_at(&table, 160, port));
        }

        assert_eq!(lock(&task_queue).immediate_len(), 1);
    }

    #[test]
    fn closest() {
        let mut table = table();
        for distance in 100..120 {
            table.add(node_at(&table, distance, distance as u16));
        }

        let target = *table.id();
        let closest = table.closest(&target);

        assert_eq!(closest.len(), BUCKET_SIZE_K);
        for (i, node) in closest.iter().enumerate() {
            assert_eq!(target.distance(node.id()), 100 + i as u8);
        }
    }

    #[test]
    fn buckets_to_refresh() {
        let mut table = table();
        table.add(node_at(&table, 42, 1));

        assert!(table.buckets_to_refresh(Duration::from_secs(60)).is_empty());
        assert_eq!(table.buckets_to_refresh(Duration::ZERO), vec![42]);
        assert_eq!(table.distances(), vec![42]);
    }
}

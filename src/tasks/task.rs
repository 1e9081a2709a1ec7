use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::common::{lock, Id, Link, LocalNode, Node};
use crate::messages::{MessageDispatcher, MessageFactory, RequestSpecific};
use crate::routing_table::RoutingTable;
use crate::Result;

use super::{TaskQueue, DHT_BUCKET_REFRESH_INTERVAL};

/// A unit of DHT work run by the interaction command.
pub trait DhtTask: Debug + Send {
    fn name(&self) -> &'static str;

    /// Runs the task, the queue drops it afterwards.
    fn run(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
/// Back-references shared by every task of one stack.
pub(crate) struct TaskContext {
    pub(crate) local_node: Link<LocalNode>,
    pub(crate) routing_table: Link<Mutex<RoutingTable>>,
    pub(crate) message_dispatcher: Link<Mutex<MessageDispatcher>>,
    pub(crate) message_factory: Link<MessageFactory>,
    pub(crate) task_queue: Link<Mutex<TaskQueue>>,
    pub(crate) timeout: Duration,
}

impl TaskContext {
    pub(crate) fn new(timeout: Duration) -> Self {
        TaskContext {
            local_node: Link::new("task_factory.local_node"),
            routing_table: Link::new("task_factory.routing_table"),
            message_dispatcher: Link::new("task_factory.message_dispatcher"),
            message_factory: Link::new("task_factory.message_factory"),
            task_queue: Link::new("task_factory.task_queue"),
            timeout,
        }
    }

    fn local_id(&self) -> Result<Id> {
        Ok(*self.local_node.require()?.id())
    }

    fn closest(&self, target: &Id) -> Result<Vec<Node>> {
        Ok(lock(&*self.routing_table.require()?).closest(target))
    }

    fn send_query(
        &self,
        request: RequestSpecific,
        to: SocketAddr,
        remote_id: Option<Id>,
    ) -> Result<()> {
        let message = self.message_factory.require()?.create_query(request);
        lock(&*self.message_dispatcher.require()?).add_message_with_timeout(
            message,
            to,
            remote_id,
            self.timeout,
        );

        Ok(())
    }
}

#[derive(Debug)]
/// Pings a single node.
pub struct PingTask {
    context: TaskContext,
    to: SocketAddr,
    remote_id: Option<Id>,
}

impl PingTask {
    pub(crate) fn new(context: TaskContext, to: SocketAddr, remote_id: Option<Id>) -> Self {
        PingTask {
            context,
            to,
            remote_id,
        }
    }
}

impl DhtTask for PingTask {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn run(&mut self) -> Result<()> {
        let requester_id = self.context.local_id()?;
        self.context
            .send_query(RequestSpecific::Ping { requester_id }, self.to, self.remote_id)
    }
}

#[derive(Debug)]
/// Asks the closest known nodes, and any extra contacts, for nodes closer to a target.
pub struct NodeLookupTask {
    context: TaskContext,
    target: Id,
    contacts: Vec<SocketAddr>,
}

impl NodeLookupTask {
    pub(crate) fn new(context: TaskContext, target: Id, contacts: Vec<SocketAddr>) -> Self {
        NodeLookupTask {
            context,
            target,
            contacts,
        }
    }

    pub fn target(&self) -> &Id {
        &self.target
    }
}

impl DhtTask for NodeLookupTask {
    fn name(&self) -> &'static str {
        "node_lookup"
    }

    fn run(&mut self) -> Result<()> {
        let requester_id = self.context.local_id()?;
        let closest = self.context.closest(&self.target)?;

        let request = RequestSpecific::FindNode {
            requester_id,
            target: self.target,
        };

        for node in &closest {
            self.context
                .send_query(request.clone(), node.address, Some(node.id))?;
        }
        for contact in &self.contacts {
            if !closest.iter().any(|node| &node.address == contact) {
                self.context.send_query(request.clone(), *contact, None)?;
            }
        }

        debug!(
            target = %self.target,
            queried = closest.len() + self.contacts.len(),
            "Started node lookup"
        );

        Ok(())
    }
}

#[derive(Debug)]
/// Schedules a node lookup for every bucket that needs a refresh.
pub struct BucketRefreshTask {
    context: TaskContext,
    force: bool,
}

impl BucketRefreshTask {
    pub(crate) fn new(context: TaskContext, force: bool) -> Self {
        BucketRefreshTask { context, force }
    }

    /// A forced refresh covers every bucket regardless of its last activity.
    pub fn force_refresh(&self) -> bool {
        self.force
    }
}

impl DhtTask for BucketRefreshTask {
    fn name(&self) -> &'static str {
        "bucket_refresh"
    }

    fn run(&mut self) -> Result<()> {
        let local_id = self.context.local_id()?;
        let routing_table = self.context.routing_table.require()?;

        let (distances, empty) = {
            let mut table = lock(&routing_table);
            let distances = if self.force {
                table.distances()
            } else {
                table.buckets_to_refresh(DHT_BUCKET_REFRESH_INTERVAL)
            };
            for distance in &distances {
                table.touch(*distance);
            }
            (distances, table.is_empty())
        };

        let mut targets: Vec<Id> = distances
            .iter()
            .map(|distance| local_id.random_at_distance(*distance))
            .collect();
        if targets.is_empty() && empty {
            targets.push(local_id);
        }

        debug!(force = self.force, buckets = targets.len(), "Refreshing buckets");

        let task_queue = self.context.task_queue.require()?;
        let mut task_queue = lock(&task_queue);
        for target in targets {
            task_queue.add_periodic_task2(Box::new(NodeLookupTask::new(
                self.context.clone(),
                target,
                Vec::new(),
            )));
        }

        Ok(())
    }
}

#[derive(Debug)]
/// Asks the closest known nodes for peers of an info hash.
pub struct PeerLookupTask {
    context: TaskContext,
    info_hash: Id,
}

impl PeerLookupTask {
    pub(crate) fn new(context: TaskContext, info_hash: Id) -> Self {
        PeerLookupTask { context, info_hash }
    }
}

impl DhtTask for PeerLookupTask {
    fn name(&self) -> &'static str {
        "peer_lookup"
    }

    fn run(&mut self) -> Result<()> {
        let requester_id = self.context.local_id()?;
        let request = RequestSpecific::GetPeers {
            requester_id,
            info_hash: self.info_hash,
        };

        for node in self.context.closest(&self.info_hash)? {
            self.context
                .send_query(request.clone(), node.address, Some(node.id))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::common::Family;
    use crate::registry::FamilyStack;
    use crate::setup::build_stack;
    use crate::transport::udp::sim::Network;
    use crate::transport::Connection;

    use super::*;

    fn stack_with_nodes(network: &Network, count: u8) -> FamilyStack {
        let connection = Connection::bind(&network.binder(), Family::Ipv4, None, 0).unwrap();
        let stack = build_stack(
            Family::Ipv4,
            Arc::new(LocalNode::new()),
            Arc::new(connection),
            Duration::from_secs(10),
        )
        .unwrap();

        let mut routing_table = lock(stack.routing_table());
        for i in 0..count {
            routing_table.add(Node::new(Id::random(), ([10, 0, 1, i + 1], 6881).into()));
        }
        drop(routing_table);

        stack
    }

    #[test]
    fn bootstrap_queries_closest_nodes_and_contacts() {
        let network = Network::new();
        let stack = stack_with_nodes(&network, 2);

        let contact: SocketAddr = ([10, 0, 2, 1], 6881).into();
        let mut task = stack
            .task_factory()
            .create_bootstrap_task(*stack.local_node().id(), vec![contact]);
        task.run().unwrap();

        assert_eq!(lock(stack.message_dispatcher()).count(), 3);
    }

    #[test]
    fn peer_lookup_queries_closest_nodes() {
        let network = Network::new();
        let stack = stack_with_nodes(&network, 2);

        let mut task = stack.task_factory().create_peer_lookup_task(Id::random());
        task.run().unwrap();

        assert_eq!(lock(stack.message_dispatcher()).count(), 2);
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Id, LocalNode, Shared};
use crate::messages::{MessageDispatcher, MessageFactory};
use crate::routing_table::RoutingTable;
use crate::Result;

use super::task::TaskContext;
use super::{BucketRefreshTask, DhtTask, NodeLookupTask, PeerLookupTask, PingTask, TaskQueue};

#[derive(Debug)]
/// Creates [DhtTask]s bound to the services of one stack.
pub struct TaskFactory {
    context: TaskContext,
}

impl TaskFactory {
    /// `timeout` is applied to every query sent by the created tasks.
    pub fn new(timeout: Duration) -> Self {
        TaskFactory {
            context: TaskContext::new(timeout),
        }
    }

    // === Wiring ===

    pub fn wire_local_node(&self, local_node: &Arc<LocalNode>) -> Result<()> {
        self.context.local_node.wire(local_node)
    }

    pub fn wire_routing_table(&self, routing_table: &Shared<RoutingTable>) -> Result<()> {
        self.context.routing_table.wire(routing_table)
    }

    pub fn wire_message_dispatcher(&self, dispatcher: &Shared<MessageDispatcher>) -> Result<()> {
        self.context.message_dispatcher.wire(dispatcher)
    }

    pub fn wire_message_factory(&self, factory: &Arc<MessageFactory>) -> Result<()> {
        self.context.message_factory.wire(factory)
    }

    pub fn wire_task_queue(&self, task_queue: &Shared<TaskQueue>) -> Result<()> {
        self.context.task_queue.wire(task_queue)
    }

    pub fn ensure_wired(&self) -> Result<()> {
        self.context.local_node.ensure_wired()?;
        self.context.routing_table.ensure_wired()?;
        self.context.message_dispatcher.ensure_wired()?;
        self.context.message_factory.ensure_wired()?;
        self.context.task_queue.ensure_wired()
    }

    // === Getters ===

    pub fn timeout(&self) -> Duration {
        self.context.timeout
    }

    // === Public Methods ===

    pub fn create_ping_task(&self, to: SocketAddr, remote_id: Option<Id>) -> Box<dyn DhtTask> {
        Box::new(PingTask::new(self.context.clone(), to, remote_id))
    }

    pub fn create_node_lookup_task(&self, target: Id) -> Box<dyn DhtTask> {
        Box::new(NodeLookupTask::new(self.context.clone(), target, Vec::new()))
    }

    /// A node lookup that also queries `contacts`, used to join the network
    /// through entry points whose ids are unknown.
    pub fn create_bootstrap_task(&self, target: Id, contacts: Vec<SocketAddr>) -> Box<dyn DhtTask> {
        Box::new(NodeLookupTask::new(self.context.clone(), target, contacts))
    }

    pub fn create_bucket_refresh_task(&self, force: bool) -> Box<dyn DhtTask> {
        Box::new(BucketRefreshTask::new(self.context.clone(), force))
    }

    pub fn create_peer_lookup_task(&self, info_hash: Id) -> Box<dyn DhtTask> {
        Box::new(PeerLookupTask::new(self.context.clone(), info_hash))
    }
}

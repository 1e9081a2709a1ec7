//! Commands handed to the host run loop by the DHT setup.
//!
//! Commands only hold [Link]s into their [FamilyStack]. Once the stack is
//! cleared from the registry every command becomes a no-op.

use std::fmt::Debug;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::common::{lock, Family, Link, LocalNode, Shared};
use crate::config::EntryPoint;
use crate::host::Cuid;
use crate::messages::{MessageDispatcher, MessageReceiver, MessageTracker, Received};
use crate::registry::FamilyStack;
use crate::routing_table::RoutingTable;
use crate::server::{PeerAnnounceStorage, TokenTracker};
use crate::state::StateSaver;
use crate::tasks::{TaskFactory, TaskQueue};
use crate::transport::{Connection, ReadinessHandle};
use crate::udp_tracker::UdpTrackerClient;
use crate::Result;

pub const DHT_TOKEN_UPDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DHT_BUCKET_REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DHT_PEER_ANNOUNCE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DHT_AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Upper bound of datagrams drained from the socket in one interaction.
const MAX_DATAGRAMS_PER_INTERACTION: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Interaction,
    TokenUpdate,
    BucketRefresh,
    PeerAnnounce,
    AutoSave,
    ForcedBucketRefresh,
    EntryPointNameResolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// When the host run loop should execute a command.
pub enum Trigger {
    /// Whenever the DHT socket is readable, and on every loop tick.
    Readiness,
    /// Repeatedly, at a fixed interval.
    Interval(Duration),
    /// Once, as soon as possible.
    Immediate,
    /// Once, and it may block on name resolution.
    Once,
}

/// A unit of work scheduled on the host run loop.
pub trait Command: Debug + Send {
    fn cuid(&self) -> Cuid;

    fn kind(&self) -> CommandKind;

    fn trigger(&self) -> Trigger;

    /// Runs one round of the command.
    ///
    /// Errors are reported to the host loop, the command stays scheduled.
    fn execute(&mut self) -> Result<()>;

    /// Called once when the host shuts down.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// The socket a [Trigger::Readiness] command waits on.
    fn readiness_handle(&self) -> Option<&ReadinessHandle> {
        None
    }
}

// === Interaction ===

#[derive(Debug)]
/// Drives message exchange: receive, run tasks, time out, send.
pub struct InteractionCommand {
    cuid: Cuid,
    readiness: ReadinessHandle,
    connection: Link<Connection>,
    message_receiver: Link<MessageReceiver>,
    message_tracker: Link<Mutex<MessageTracker>>,
    message_dispatcher: Link<Mutex<MessageDispatcher>>,
    task_queue: Link<Mutex<TaskQueue>>,
    udp_tracker_client: Option<Shared<UdpTrackerClient>>,
}

impl InteractionCommand {
    pub fn new(
        cuid: Cuid,
        stack: &FamilyStack,
        readiness: ReadinessHandle,
        udp_tracker_client: Option<Shared<UdpTrackerClient>>,
    ) -> Self {
        InteractionCommand {
            cuid,
            readiness,
            connection: Link::to("interaction.connection", &stack.connection),
            message_receiver: Link::to("interaction.message_receiver", &stack.message_receiver),
            message_tracker: Link::to("interaction.message_tracker", &stack.message_tracker),
            message_dispatcher: Link::to(
                "interaction.message_dispatcher",
                &stack.message_dispatcher,
            ),
            task_queue: Link::to("interaction.task_queue", &stack.task_queue),
            udp_tracker_client,
        }
    }

    fn receive(&self, receiver: &MessageReceiver) {
        for _ in 0..MAX_DATAGRAMS_PER_INTERACTION {
            match receiver.receive_message() {
                Ok(Received::Nothing) => break,
                Ok(Received::Foreign(bytes, from)) => {
                    let claimed = self
                        .udp_tracker_client
                        .as_ref()
                        .is_some_and(|client| lock(client).receive_reply(&bytes, from));
                    if !claimed {
                        trace!(?from, size = bytes.len(), "Dropped foreign datagram");
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(?error, "Failed to receive DHT datagram");
                    break;
                }
            }
        }
    }
}

impl Command for InteractionCommand {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Interaction
    }

    fn trigger(&self) -> Trigger {
        Trigger::Readiness
    }

    fn execute(&mut self) -> Result<()> {
        let Some(receiver) = self.message_receiver.get() else {
            return Ok(());
        };
        self.receive(&receiver);

        if let Some(task_queue) = self.task_queue.get() {
            let tasks = lock(&task_queue).take_ready();
            for mut task in tasks {
                if let Err(error) = task.run() {
                    debug!(task = task.name(), ?error, "DHT task failed");
                }
            }
        }

        if let Some(tracker) = self.message_tracker.get() {
            lock(&tracker).handle_timeout();
        }

        if let (Some(dispatcher), Some(connection)) =
            (self.message_dispatcher.get(), self.connection.get())
        {
            lock(&dispatcher).send_messages(&connection);
        }

        if let Some(client) = &self.udp_tracker_client {
            lock(client).handle_timeout();
        }

        Ok(())
    }

    fn readiness_handle(&self) -> Option<&ReadinessHandle> {
        Some(&self.readiness)
    }
}

// === Token update ===

#[derive(Debug)]
/// Rotates the announce token secret.
pub struct TokenUpdateCommand {
    cuid: Cuid,
    interval: Duration,
    token_tracker: Link<Mutex<TokenTracker>>,
}

impl TokenUpdateCommand {
    pub fn new(cuid: Cuid, stack: &FamilyStack, interval: Duration) -> Self {
        TokenUpdateCommand {
            cuid,
            interval,
            token_tracker: Link::to("token_update.token_tracker", &stack.token_tracker),
        }
    }
}

impl Command for TokenUpdateCommand {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn kind(&self) -> CommandKind {
        CommandKind::TokenUpdate
    }

    fn trigger(&self) -> Trigger {
        Trigger::Interval(self.interval)
    }

    fn execute(&mut self) -> Result<()> {
        if let Some(token_tracker) = self.token_tracker.get() {
            lock(&token_tracker).update_token_secret();
        }

        Ok(())
    }
}

// === Bucket refresh ===

#[derive(Debug)]
/// Queues a bucket refresh task, which refreshes stale buckets only.
pub struct BucketRefreshCommand {
    cuid: Cuid,
    interval: Duration,
    task_queue: Link<Mutex<TaskQueue>>,
    task_factory: Link<TaskFactory>,
}

impl BucketRefreshCommand {
    pub fn new(cuid: Cuid, stack: &FamilyStack, interval: Duration) -> Self {
        BucketRefreshCommand {
            cuid,
            interval,
            task_queue: Link::to("bucket_refresh.task_queue", &stack.task_queue),
            task_factory: Link::to("bucket_refresh.task_factory", &stack.task_factory),
        }
    }
}

impl Command for BucketRefreshCommand {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn kind(&self) -> CommandKind {
        CommandKind::BucketRefresh
    }

    fn trigger(&self) -> Trigger {
        Trigger::Interval(self.interval)
    }

    fn execute(&mut self) -> Result<()> {
        if let (Some(task_queue), Some(task_factory)) =
            (self.task_queue.get(), self.task_factory.get())
        {
            let task = task_factory.create_bucket_refresh_task(false);
            lock(&task_queue).add_periodic_task1(task);
        }

        Ok(())
    }
}

// === Peer announce ===

#[derive(Debug)]
/// Expires stale peer announces.
pub struct PeerAnnounceCommand {
    cuid: Cuid,
    interval: Duration,
    peer_announce_storage: Link<Mutex<PeerAnnounceStorage>>,
}

impl PeerAnnounceCommand {
    pub fn new(cuid: Cuid, stack: &FamilyStack, interval: Duration) -> Self {
        PeerAnnounceCommand {
            cuid,
            interval,
            peer_announce_storage: Link::to(
                "peer_announce.peer_announce_storage",
                &stack.peer_announce_storage,
            ),
        }
    }
}

impl Command for PeerAnnounceCommand {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn kind(&self) -> CommandKind {
        CommandKind::PeerAnnounce
    }

    fn trigger(&self) -> Trigger {
        Trigger::Interval(self.interval)
    }

    fn execute(&mut self) -> Result<()> {
        if let Some(storage) = self.peer_announce_storage.get() {
            lock(&storage).handle_timeout();
        }

        Ok(())
    }
}

// === Auto save ===

#[derive(Debug)]
/// Persists the local node and the routing table, periodically and on shutdown.
pub struct AutoSaveCommand {
    cuid: Cuid,
    interval: Duration,
    family: Family,
    path: PathBuf,
    local_node: Link<LocalNode>,
    routing_table: Link<Mutex<RoutingTable>>,
}

impl AutoSaveCommand {
    pub fn new(cuid: Cuid, stack: &FamilyStack, path: PathBuf, interval: Duration) -> Self {
        AutoSaveCommand {
            cuid,
            interval,
            family: stack.family,
            path,
            local_node: Link::to("auto_save.local_node", &stack.local_node),
            routing_table: Link::to("auto_save.routing_table", &stack.routing_table),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let (Some(local_node), Some(routing_table)) =
            (self.local_node.get(), self.routing_table.get())
        else {
            return Ok(());
        };

        let nodes = lock(&routing_table).nodes();
        StateSaver::new(self.family).save(&self.path, &local_node, &nodes)?;

        info!(family = %self.family, path = ?self.path, nodes = nodes.len(), "Saved DHT routing table");

        Ok(())
    }
}

impl Command for AutoSaveCommand {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn kind(&self) -> CommandKind {
        CommandKind::AutoSave
    }

    fn trigger(&self) -> Trigger {
        Trigger::Interval(self.interval)
    }

    fn execute(&mut self) -> Result<()> {
        self.save()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.save()
    }
}

// === Forced bucket refresh ===

#[derive(Debug)]
/// Refreshes every bucket once, to re-validate nodes recovered from disk.
pub struct ForcedBucketRefreshCommand {
    cuid: Cuid,
    done: bool,
    task_queue: Link<Mutex<TaskQueue>>,
    task_factory: Link<TaskFactory>,
}

impl ForcedBucketRefreshCommand {
    pub fn new(cuid: Cuid, stack: &FamilyStack) -> Self {
        ForcedBucketRefreshCommand {
            cuid,
            done: false,
            task_queue: Link::to("forced_bucket_refresh.task_queue", &stack.task_queue),
            task_factory: Link::to("forced_bucket_refresh.task_factory", &stack.task_factory),
        }
    }
}

impl Command for ForcedBucketRefreshCommand {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn kind(&self) -> CommandKind {
        CommandKind::ForcedBucketRefresh
    }

    fn trigger(&self) -> Trigger {
        Trigger::Immediate
    }

    fn execute(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        if let (Some(task_queue), Some(task_factory)) =
            (self.task_queue.get(), self.task_factory.get())
        {
            let task = task_factory.create_bucket_refresh_task(true);
            lock(&task_queue).add_periodic_task1(task);
        }

        Ok(())
    }
}

// === Entry point ===

#[derive(Debug)]
/// Resolves the configured entry points once and joins the network through them.
pub struct EntryPointNameResolveCommand {
    cuid: Cuid,
    family: Family,
    entry_points: Vec<EntryPoint>,
    bootstrap_enabled: bool,
    done: bool,
    local_node: Link<LocalNode>,
    task_queue: Link<Mutex<TaskQueue>>,
    task_factory: Link<TaskFactory>,
}

impl EntryPointNameResolveCommand {
    pub fn new(cuid: Cuid, stack: &FamilyStack, entry_points: Vec<EntryPoint>) -> Self {
        EntryPointNameResolveCommand {
            cuid,
            family: stack.family,
            entry_points,
            bootstrap_enabled: false,
            done: false,
            local_node: Link::to("entry_point.local_node", &stack.local_node),
            task_queue: Link::to("entry_point.task_queue", &stack.task_queue),
            task_factory: Link::to("entry_point.task_factory", &stack.task_factory),
        }
    }

    /// Also look up our own id and refresh the buckets once the entry points respond.
    pub fn set_bootstrap_enabled(&mut self, enabled: bool) {
        self.bootstrap_enabled = enabled;
    }

    pub fn bootstrap_enabled(&self) -> bool {
        self.bootstrap_enabled
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    fn resolve(&self) -> Vec<SocketAddr> {
        let mut addresses = Vec::new();

        for entry_point in &self.entry_points {
            match (entry_point.host.as_str(), entry_point.port).to_socket_addrs() {
                Ok(resolved) => {
                    addresses.extend(resolved.filter(|address| self.family.matches(address)))
                }
                Err(error) => {
                    error!(
                        host = %entry_point.host,
                        port = entry_point.port,
                        ?error,
                        "Failed to resolve DHT entry point"
                    );
                }
            }
        }

        addresses
    }
}

impl Command for EntryPointNameResolveCommand {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn kind(&self) -> CommandKind {
        CommandKind::EntryPointNameResolve
    }

    fn trigger(&self) -> Trigger {
        Trigger::Once
    }

    fn execute(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        let (Some(local_node), Some(task_queue), Some(task_factory)) = (
            self.local_node.get(),
            self.task_queue.get(),
            self.task_factory.get(),
        ) else {
            return Ok(());
        };

        let addresses = self.resolve();
        if addresses.is_empty() {
            error!(family = %self.family, "No DHT entry point could be resolved");
            return Ok(());
        }

        debug!(family = %self.family, ?addresses, "Resolved DHT entry points");

        let mut task_queue = lock(&task_queue);
        for address in &addresses {
            task_queue.add_periodic_task1(task_factory.create_ping_task(*address, None));
        }
        if self.bootstrap_enabled {
            task_queue.add_periodic_task1(
                task_factory.create_bootstrap_task(*local_node.id(), addresses),
            );
            task_queue.add_periodic_task1(task_factory.create_bucket_refresh_task(false));
        }

        Ok(())
    }
}

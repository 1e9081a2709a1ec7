//! Bootstrap of one DHT address family.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::commands::{
    AutoSaveCommand, BucketRefreshCommand, Command, EntryPointNameResolveCommand,
    ForcedBucketRefreshCommand, InteractionCommand, PeerAnnounceCommand, TokenUpdateCommand,
    DHT_AUTO_SAVE_INTERVAL, DHT_BUCKET_REFRESH_CHECK_INTERVAL, DHT_PEER_ANNOUNCE_CHECK_INTERVAL,
    DHT_TOKEN_UPDATE_INTERVAL,
};
use crate::common::{lock, Family, LocalNode, Shared};
use crate::config::FamilyConfig;
use crate::host::Host;
use crate::messages::{MessageDispatcher, MessageFactory, MessageReceiver, MessageTracker};
use crate::registry::FamilyStack;
use crate::routing_table::RoutingTable;
use crate::server::{PeerAnnounceStorage, TokenTracker};
use crate::state::{Snapshot, StateLoader};
use crate::tasks::{TaskFactory, TaskQueue};
use crate::transport::Connection;
use crate::udp_tracker::UdpTrackerClient;
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Copy)]
/// Sets up the DHT stack of an address family on a [Host].
pub struct DhtSetup;

impl DhtSetup {
    /// Sets up the DHT for a raw address family code (`AF_INET` or `AF_INET6`).
    ///
    /// Returns the commands the host run loop should schedule, or nothing if
    /// the family is unknown, already active, or failed to activate.
    pub fn setup(host: &mut Host, family: i32) -> Vec<Box<dyn Command>> {
        match Family::try_from(family) {
            Ok(family) => Self::setup_family(host, family),
            Err(_) => Vec::new(),
        }
    }

    /// Same as [Self::setup] for a known family.
    ///
    /// Activation is all or nothing: on failure the family's registry slot is
    /// absent again and the host is left as it was, so setup can be retried.
    pub fn setup_family(host: &mut Host, family: Family) -> Vec<Box<dyn Command>> {
        if !host.dht().is_absent(family) {
            return Vec::new();
        }

        let mut rollback = Rollback::new(family);
        match activate(host, family, &mut rollback) {
            Ok(commands) => commands,
            Err(error) => {
                error!(
                    %family,
                    ?error,
                    "Exception caught while initializing DHT functionality. DHT is disabled."
                );
                rollback.run(host);
                Vec::new()
            }
        }
    }
}

fn activate(
    host: &mut Host,
    family: Family,
    rollback: &mut Rollback,
) -> Result<Vec<Box<dyn Command>>> {
    let family_config = host.config().family(family).clone();
    let message_timeout = host.config().message_timeout;

    let snapshot = load_state(&family_config.state_file, family);

    let shared_port = host.udp_port();
    let connection = bind(host, family, shared_port)?;
    let port = connection.port();

    let recovered = !snapshot.nodes.is_empty();
    let mut local_node = snapshot.local_node.unwrap_or_default();
    local_node.set_port(port);
    debug!(%family, id = %local_node.id(), port, "Initialized local node");

    let stack = build_stack(
        family,
        Arc::new(local_node),
        Arc::new(connection),
        message_timeout,
    )?;

    host.dht_mut().stage(stack.share())?;
    rollback.record(Compensation::ClearRegistry);

    let udp_tracker_client = match family {
        Family::Ipv4 => {
            let client = Arc::new(Mutex::new(UdpTrackerClient::new()));
            let previous = host.udp_tracker_client().cloned();
            host.set_udp_tracker_client(Some(client.clone()));
            rollback.record(Compensation::RestoreUdpTrackerClient(previous));
            Some(client)
        }
        Family::Ipv6 => None,
    };

    {
        let mut routing_table = lock(&stack.routing_table);
        for node in snapshot.nodes {
            routing_table.add(node);
        }
    }

    stack.ensure_wired()?;

    let commands = schedule(host, &stack, recovered, &family_config, udp_tracker_client)?;

    host.dht_mut().activate(family)?;
    rollback.commit();

    if shared_port == 0 {
        host.set_udp_port(port);
    }

    info!(%family, port, commands = commands.len(), "DHT is enabled");

    Ok(commands)
}

/// Reads the persisted snapshot, falling back to a fresh identity.
fn load_state(path: &Path, family: Family) -> Snapshot {
    match StateLoader::new(family).load(path) {
        Ok(snapshot) => snapshot,
        Err(Error::IO(error)) if error.kind() == io::ErrorKind::NotFound => {
            info!(%family, ?path, "No DHT routing table found, starting with a new node id");
            Snapshot::default()
        }
        Err(error) => {
            error!(
                %family,
                ?path,
                ?error,
                "Exception caught while loading DHT routing table"
            );
            Snapshot::default()
        }
    }
}

/// Binds the port shared with the rest of the host, or negotiates one.
fn bind(host: &Host, family: Family, shared_port: u16) -> Result<Connection> {
    let config = host.config();
    let address = config.family(family).listen_address;

    if shared_port == 0 {
        Connection::bind_candidates(host.binder(), family, address, &config.listen_ports)
    } else {
        Connection::bind(host.binder(), family, address, shared_port)
    }
}

/// Constructs the services of a family and wires their back-references.
pub(crate) fn build_stack(
    family: Family,
    local_node: Arc<LocalNode>,
    connection: Arc<Connection>,
    message_timeout: Duration,
) -> Result<FamilyStack> {
    let routing_table: Shared<RoutingTable> =
        Arc::new(Mutex::new(RoutingTable::new(family, &local_node)));
    let message_tracker = Arc::new(Mutex::new(MessageTracker::new()));
    let message_dispatcher = Arc::new(Mutex::new(MessageDispatcher::new(message_timeout)));
    let message_receiver = Arc::new(MessageReceiver::new());
    let task_factory = Arc::new(TaskFactory::new(message_timeout));
    let task_queue = Arc::new(Mutex::new(TaskQueue::new()));
    let peer_announce_storage = Arc::new(Mutex::new(PeerAnnounceStorage::new()));
    let token_tracker = Arc::new(Mutex::new(TokenTracker::new()));
    let message_factory = Arc::new(MessageFactory::new(family));

    lock(&message_tracker).wire_routing_table(&routing_table)?;

    lock(&message_dispatcher).wire_message_tracker(&message_tracker)?;

    message_receiver.wire_connection(&connection)?;
    message_receiver.wire_message_factory(&message_factory)?;
    message_receiver.wire_routing_table(&routing_table)?;
    message_receiver.wire_message_tracker(&message_tracker)?;

    task_factory.wire_local_node(&local_node)?;
    task_factory.wire_routing_table(&routing_table)?;
    task_factory.wire_message_dispatcher(&message_dispatcher)?;
    task_factory.wire_message_factory(&message_factory)?;
    task_factory.wire_task_queue(&task_queue)?;

    {
        let routing_table = lock(&routing_table);
        routing_table.wire_task_queue(&task_queue)?;
        routing_table.wire_task_factory(&task_factory)?;
    }

    {
        let peer_announce_storage = lock(&peer_announce_storage);
        peer_announce_storage.wire_task_queue(&task_queue)?;
        peer_announce_storage.wire_task_factory(&task_factory)?;
    }

    message_factory.wire_routing_table(&routing_table)?;
    message_factory.wire_message_dispatcher(&message_dispatcher)?;
    message_factory.wire_peer_announce_storage(&peer_announce_storage)?;
    message_factory.wire_token_tracker(&token_tracker)?;
    message_factory.wire_local_node(&local_node)?;

    Ok(FamilyStack {
        family,
        local_node,
        connection,
        routing_table,
        message_tracker,
        message_dispatcher,
        message_receiver,
        message_factory,
        task_queue,
        task_factory,
        peer_announce_storage,
        token_tracker,
    })
}

/// Builds the commands of a staged stack, in the order the host runs them.
fn schedule(
    host: &mut Host,
    stack: &FamilyStack,
    recovered: bool,
    family_config: &FamilyConfig,
    udp_tracker_client: Option<Shared<UdpTrackerClient>>,
) -> Result<Vec<Box<dyn Command>>> {
    let readiness = stack.connection.readiness_handle()?;

    let mut commands: Vec<Box<dyn Command>> = vec![
        Box::new(InteractionCommand::new(
            host.new_cuid(),
            stack,
            readiness,
            udp_tracker_client,
        )),
        Box::new(TokenUpdateCommand::new(
            host.new_cuid(),
            stack,
            DHT_TOKEN_UPDATE_INTERVAL,
        )),
        Box::new(BucketRefreshCommand::new(
            host.new_cuid(),
            stack,
            DHT_BUCKET_REFRESH_CHECK_INTERVAL,
        )),
        Box::new(PeerAnnounceCommand::new(
            host.new_cuid(),
            stack,
            DHT_PEER_ANNOUNCE_CHECK_INTERVAL,
        )),
        Box::new(AutoSaveCommand::new(
            host.new_cuid(),
            stack,
            family_config.state_file.clone(),
            DHT_AUTO_SAVE_INTERVAL,
        )),
    ];

    if recovered {
        commands.push(Box::new(ForcedBucketRefreshCommand::new(
            host.new_cuid(),
            stack,
        )));
    }

    match &family_config.entry_point {
        Some(entry_point) if !entry_point.host.trim().is_empty() => {
            let mut command =
                EntryPointNameResolveCommand::new(host.new_cuid(), stack, vec![entry_point.clone()]);
            command.set_bootstrap_enabled(true);
            commands.push(Box::new(command));
        }
        _ => info!("No DHT entry point specified."),
    }

    Ok(commands)
}

#[derive(Debug)]
/// Undoes one side effect of a failed activation.
enum Compensation {
    /// Return the family's registry slot to absent.
    ClearRegistry,
    /// Put back the UDP tracker client the host had before.
    RestoreUdpTrackerClient(Option<Shared<UdpTrackerClient>>),
}

#[derive(Debug)]
/// Side effects of an activation in progress, undone in reverse on failure.
struct Rollback {
    family: Family,
    compensations: Vec<Compensation>,
}

impl Rollback {
    fn new(family: Family) -> Self {
        Rollback {
            family,
            compensations: Vec::new(),
        }
    }

    fn record(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    /// The activation succeeded, nothing to undo.
    fn commit(&mut self) {
        self.compensations.clear();
    }

    fn run(self, host: &mut Host) {
        let family = self.family;

        for compensation in self.compensations.into_iter().rev() {
            debug!(%family, ?compensation, "Rolling back DHT activation");

            match compensation {
                Compensation::ClearRegistry => {
                    host.dht_mut().clear(family);
                }
                Compensation::RestoreUdpTrackerClient(previous) => {
                    host.set_udp_tracker_client(previous);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::config::Config;
    use crate::registry::SlotState;
    use crate::transport::udp::sim::Network;

    use super::*;

    fn host(network: &Network) -> Host {
        let dir = std::env::temp_dir().join("dhtboot-setup-unit-missing");
        let config = Config::default()
            .with_listen_ports(vec![7000])
            .with_state_file(Family::Ipv4, dir.join("dht.dat"))
            .with_state_file(Family::Ipv6, dir.join("dht6.dat"));

        Host::with_binder(config, Box::new(network.binder()))
    }

    #[test]
    fn rollback_restores_previous_udp_tracker_client() {
        let network = Network::new();
        let mut host = host(&network);

        let previous = Arc::new(Mutex::new(UdpTrackerClient::new()));
        host.set_udp_tracker_client(Some(previous.clone()));

        network.fail_clones(true);
        assert!(DhtSetup::setup_family(&mut host, Family::Ipv4).is_empty());

        let current = host.udp_tracker_client().cloned();
        assert!(current.is_some_and(|client| Arc::ptr_eq(&client, &previous)));
        assert_eq!(host.dht().state(Family::Ipv4), SlotState::Absent);
    }

    #[test]
    fn failed_activation_drops_the_stack() {
        let network = Network::new();
        let mut host = host(&network);

        network.fail_clones(true);
        assert!(DhtSetup::setup_family(&mut host, Family::Ipv4).is_empty());

        let address = "0.0.0.0:7000".parse().unwrap();
        assert!(!network.is_bound(&address));
        assert_eq!(host.udp_port(), 0);
    }

    #[test]
    fn built_stack_is_fully_wired() {
        let network = Network::new();
        let connection =
            Connection::bind(&network.binder(), Family::Ipv6, None, 0).unwrap();

        let stack = build_stack(
            Family::Ipv6,
            Arc::new(LocalNode::new()),
            Arc::new(connection),
            Duration::from_secs(10),
        )
        .unwrap();

        stack.ensure_wired().unwrap();
        assert_eq!(stack.family(), Family::Ipv6);
        assert_eq!(lock(stack.routing_table()).family(), Family::Ipv6);
    }
}

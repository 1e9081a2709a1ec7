//! Per-family DHT registry.
//!
//! A [FamilyStack] owns every service of one address family. Services only
//! hold [Link](crate::common::Link)s to each other, so clearing a slot drops
//! the whole graph.

use std::sync::Arc;

use crate::common::{lock, Family, LocalNode, Shared};
use crate::messages::{MessageDispatcher, MessageFactory, MessageReceiver, MessageTracker};
use crate::routing_table::RoutingTable;
use crate::server::{PeerAnnounceStorage, TokenTracker};
use crate::tasks::{TaskFactory, TaskQueue};
use crate::transport::Connection;
use crate::{Error, Result};

#[derive(Debug)]
/// Strong owner of the services of one address family.
///
/// Not `Clone`: outside of setup the registry holds the only instance.
pub struct FamilyStack {
    pub(crate) family: Family,
    pub(crate) local_node: Arc<LocalNode>,
    pub(crate) connection: Arc<Connection>,
    pub(crate) routing_table: Shared<RoutingTable>,
    pub(crate) message_tracker: Shared<MessageTracker>,
    pub(crate) message_dispatcher: Shared<MessageDispatcher>,
    pub(crate) message_receiver: Arc<MessageReceiver>,
    pub(crate) message_factory: Arc<MessageFactory>,
    pub(crate) task_queue: Shared<TaskQueue>,
    pub(crate) task_factory: Arc<TaskFactory>,
    pub(crate) peer_announce_storage: Shared<PeerAnnounceStorage>,
    pub(crate) token_tracker: Shared<TokenTracker>,
}

impl FamilyStack {
    // === Getters ===

    pub fn family(&self) -> Family {
        self.family
    }

    /// The UDP port this stack is bound to.
    pub fn port(&self) -> u16 {
        self.connection.port()
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local_node
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn routing_table(&self) -> &Shared<RoutingTable> {
        &self.routing_table
    }

    pub fn message_tracker(&self) -> &Shared<MessageTracker> {
        &self.message_tracker
    }

    pub fn message_dispatcher(&self) -> &Shared<MessageDispatcher> {
        &self.message_dispatcher
    }

    pub fn message_receiver(&self) -> &Arc<MessageReceiver> {
        &self.message_receiver
    }

    pub fn message_factory(&self) -> &Arc<MessageFactory> {
        &self.message_factory
    }

    pub fn task_queue(&self) -> &Shared<TaskQueue> {
        &self.task_queue
    }

    pub fn task_factory(&self) -> &Arc<TaskFactory> {
        &self.task_factory
    }

    pub fn peer_announce_storage(&self) -> &Shared<PeerAnnounceStorage> {
        &self.peer_announce_storage
    }

    pub fn token_tracker(&self) -> &Shared<TokenTracker> {
        &self.token_tracker
    }

    /// A second owner of the services, held by setup until the stack is active.
    pub(crate) fn share(&self) -> FamilyStack {
        FamilyStack {
            family: self.family,
            local_node: self.local_node.clone(),
            connection: self.connection.clone(),
            routing_table: self.routing_table.clone(),
            message_tracker: self.message_tracker.clone(),
            message_dispatcher: self.message_dispatcher.clone(),
            message_receiver: self.message_receiver.clone(),
            message_factory: self.message_factory.clone(),
            task_queue: self.task_queue.clone(),
            task_factory: self.task_factory.clone(),
            peer_announce_storage: self.peer_announce_storage.clone(),
            token_tracker: self.token_tracker.clone(),
        }
    }

    // === Public Methods ===

    /// Checks that every back-reference between the services is in place.
    pub fn ensure_wired(&self) -> Result<()> {
        lock(&self.routing_table).ensure_wired()?;
        lock(&self.message_tracker).ensure_wired()?;
        lock(&self.message_dispatcher).ensure_wired()?;
        self.message_receiver.ensure_wired()?;
        self.message_factory.ensure_wired()?;
        self.task_factory.ensure_wired()?;
        lock(&self.peer_announce_storage).ensure_wired()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of one registry slot.
pub enum SlotState {
    Absent,
    /// Registered by a setup still in progress, invisible to [Registry::get].
    Activating,
    Active,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Absent,
    Activating(FamilyStack),
    Active(FamilyStack),
}

impl Slot {
    fn state(&self) -> SlotState {
        match self {
            Slot::Absent => SlotState::Absent,
            Slot::Activating(_) => SlotState::Activating,
            Slot::Active(_) => SlotState::Active,
        }
    }
}

#[derive(Debug, Default)]
/// One slot per address family.
pub struct Registry {
    ipv4: Slot,
    ipv6: Slot,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, family: Family) -> &Slot {
        match family {
            Family::Ipv4 => &self.ipv4,
            Family::Ipv6 => &self.ipv6,
        }
    }

    fn slot_mut(&mut self, family: Family) -> &mut Slot {
        match family {
            Family::Ipv4 => &mut self.ipv4,
            Family::Ipv6 => &mut self.ipv6,
        }
    }

    // === Getters ===

    /// The active stack of a family, if any.
    pub fn get(&self, family: Family) -> Option<&FamilyStack> {
        match self.slot(family) {
            Slot::Active(stack) => Some(stack),
            _ => None,
        }
    }

    pub fn state(&self, family: Family) -> SlotState {
        self.slot(family).state()
    }

    pub fn is_active(&self, family: Family) -> bool {
        self.state(family) == SlotState::Active
    }

    pub fn is_absent(&self, family: Family) -> bool {
        self.state(family) == SlotState::Absent
    }

    // === Transitions ===

    /// Places a fully built stack in its family's slot, not yet visible.
    pub(crate) fn stage(&mut self, stack: FamilyStack) -> Result<()> {
        let family = stack.family;
        let slot = self.slot_mut(family);
        if !matches!(slot, Slot::Absent) {
            return Err(Error::Registry {
                family,
                reason: "already occupied",
            });
        }

        *slot = Slot::Activating(stack);
        Ok(())
    }

    #[cfg(test)]
    fn staged(&self, family: Family) -> Option<&FamilyStack> {
        match self.slot(family) {
            Slot::Activating(stack) => Some(stack),
            _ => None,
        }
    }

    /// Publishes a staged stack.
    pub(crate) fn activate(&mut self, family: Family) -> Result<()> {
        let slot = self.slot_mut(family);
        match std::mem::take(slot) {
            Slot::Activating(stack) => {
                *slot = Slot::Active(stack);
                Ok(())
            }
            other => {
                let reason = match other {
                    Slot::Absent => "nothing staged",
                    _ => "already active",
                };
                *slot = other;
                Err(Error::Registry { family, reason })
            }
        }
    }

    /// Returns the family's slot to absent, dropping its stack.
    pub(crate) fn clear(&mut self, family: Family) -> Option<FamilyStack> {
        match std::mem::take(self.slot_mut(family)) {
            Slot::Absent => None,
            Slot::Activating(stack) | Slot::Active(stack) => Some(stack),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::setup::build_stack;
    use crate::transport::udp::sim::Network;

    use super::*;

    fn stack(network: &Network, family: Family) -> FamilyStack {
        let connection = Connection::bind(&network.binder(), family, None, 0).unwrap();

        build_stack(
            family,
            Arc::new(LocalNode::new()),
            Arc::new(connection),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[test]
    fn staged_stack_is_not_visible() {
        let network = Network::new();
        let mut registry = Registry::new();

        registry.stage(stack(&network, Family::Ipv4)).unwrap();

        assert_eq!(registry.state(Family::Ipv4), SlotState::Activating);
        assert!(registry.get(Family::Ipv4).is_none());
        assert!(registry.staged(Family::Ipv4).is_some());

        registry.activate(Family::Ipv4).unwrap();
        assert!(registry.is_active(Family::Ipv4));
        assert!(registry.get(Family::Ipv4).is_some());
        assert!(registry.is_absent(Family::Ipv6));
    }

    #[test]
    fn invalid_transitions() {
        let network = Network::new();
        let mut registry = Registry::new();

        assert!(matches!(
            registry.activate(Family::Ipv6),
            Err(Error::Registry {
                family: Family::Ipv6,
                reason: "nothing staged"
            })
        ));

        registry.stage(stack(&network, Family::Ipv6)).unwrap();
        assert!(registry.stage(stack(&network, Family::Ipv6)).is_err());

        registry.activate(Family::Ipv6).unwrap();
        assert!(registry.activate(Family::Ipv6).is_err());
        assert!(registry.is_active(Family::Ipv6));
    }

    #[test]
    fn clear_drops_the_services() {
        let network = Network::new();
        let mut registry = Registry::new();

        let stack = stack(&network, Family::Ipv4);
        let address = stack.connection().local_addr();
        let routing_table = Arc::downgrade(stack.routing_table());

        registry.stage(stack).unwrap();
        registry.activate(Family::Ipv4).unwrap();

        assert!(registry.clear(Family::Ipv4).is_some());
        assert!(registry.is_absent(Family::Ipv4));
        assert!(routing_table.upgrade().is_none());
        assert!(!network.is_bound(&address));
        assert!(registry.clear(Family::Ipv4).is_none());
    }
}

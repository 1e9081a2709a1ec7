//! Reads datagrams from the DHT socket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::common::{lock, Link, Node, Shared};
use crate::routing_table::RoutingTable;
use crate::transport::{Connection, MTU};
use crate::Result;

use super::{Message, MessageFactory, MessageTracker, MessageType};

#[derive(Debug, PartialEq)]
/// Outcome of one [MessageReceiver::receive_message] call.
pub enum Received {
    /// The socket had nothing to read.
    Nothing,
    /// A valid request, or a response to one of our queries.
    Message(Message, SocketAddr),
    /// A datagram that is not bencoded, like a UDP tracker reply sharing the socket.
    Foreign(Vec<u8>, SocketAddr),
    /// Malformed or unsolicited, dropped.
    Ignored,
}

#[derive(Debug)]
pub struct MessageReceiver {
    connection: Link<Connection>,
    message_factory: Link<MessageFactory>,
    routing_table: Link<Mutex<RoutingTable>>,
    message_tracker: Link<Mutex<MessageTracker>>,
}

impl MessageReceiver {
    pub fn new() -> Self {
        MessageReceiver {
            connection: Link::new("message_receiver.connection"),
            message_factory: Link::new("message_receiver.message_factory"),
            routing_table: Link::new("message_receiver.routing_table"),
            message_tracker: Link::new("message_receiver.message_tracker"),
        }
    }

    // === Wiring ===

    pub fn wire_connection(&self, connection: &Arc<Connection>) -> Result<()> {
        self.connection.wire(connection)
    }

    pub fn wire_message_factory(&self, factory: &Arc<MessageFactory>) -> Result<()> {
        self.message_factory.wire(factory)
    }

    pub fn wire_routing_table(&self, routing_table: &Shared<RoutingTable>) -> Result<()> {
        self.routing_table.wire(routing_table)
    }

    pub fn wire_message_tracker(&self, tracker: &Shared<MessageTracker>) -> Result<()> {
        self.message_tracker.wire(tracker)
    }

    pub fn ensure_wired(&self) -> Result<()> {
        self.connection.ensure_wired()?;
        self.message_factory.ensure_wired()?;
        self.routing_table.ensure_wired()?;
        self.message_tracker.ensure_wired()
    }

    // === Public Methods ===

    /// Reads and handles a single datagram.
    ///
    /// Requests are answered right away, responses are matched against the
    /// tracker, and the author of any accepted message is added to the
    /// routing table.
    pub fn receive_message(&self) -> Result<Received> {
        let connection = self.connection.require()?;

        let mut buf = [0_u8; MTU];
        let Some((size, from)) = connection.receive_message(&mut buf)? else {
            return Ok(Received::Nothing);
        };
        let bytes = &buf[..size];

        if from.port() == 0 {
            trace!(?from, "Datagram from port 0");
            return Ok(Received::Ignored);
        }

        if bytes.first() != Some(&b'd') {
            return Ok(Received::Foreign(bytes.to_vec(), from));
        }

        let factory = self.message_factory.require()?;
        let message = match factory.decode(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid KRPC message."
                );
                return Ok(Received::Ignored);
            }
        };

        match &message.message_type {
            MessageType::Request(request) => {
                trace!(?message, ?from, "Received request message");
                if let Err(error) = factory.handle_request(request, message.transaction_id, from) {
                    debug!(?error, ?from, "Failed to answer request");
                }
            }
            MessageType::Response(_) | MessageType::Error(_) => {
                trace!(?message, ?from, "Received response message");
                let expected = lock(&*self.message_tracker.require()?)
                    .message_arrived(message.transaction_id, &from)
                    .is_some();
                if !expected {
                    return Ok(Received::Ignored);
                }
            }
        }

        if let Some(id) = message.author_id() {
            lock(&*self.routing_table.require()?).add(Node::new(*id, from));
        }

        Ok(Received::Message(message, from))
    }
}

impl Default for MessageReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::common::{Family, Id, LocalNode};
    use crate::messages::{RequestSpecific, ResponseSpecific};
    use crate::registry::FamilyStack;
    use crate::setup::build_stack;
    use crate::transport::udp::sim::Network;

    use super::*;

    fn stack(network: &Network) -> FamilyStack {
        let connection = Connection::bind(&network.binder(), Family::Ipv4, None, 0).unwrap();

        build_stack(
            Family::Ipv4,
            Arc::new(LocalNode::new()),
            Arc::new(connection),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[test]
    fn request_is_answered_and_author_added() {
        let network = Network::new();
        let stack = stack(&network);

        let remote: SocketAddr = ([10, 0, 0, 5], 6881).into();
        let remote_id = Id::random();
        let ping = Message {
            transaction_id: 3,
            message_type: MessageType::Request(RequestSpecific::Ping {
                requester_id: remote_id,
            }),
        };
        network.deliver(
            remote,
            stack.connection().local_addr(),
            &ping.to_bytes(Family::Ipv4).unwrap(),
        );

        let received = stack.message_receiver().receive_message().unwrap();

        assert_eq!(received, Received::Message(ping, remote));
        assert!(lock(stack.routing_table()).contains(&remote_id));
        assert_eq!(lock(stack.message_dispatcher()).count(), 1);
    }

    #[test]
    fn unsolicited_response_is_ignored() {
        let network = Network::new();
        let stack = stack(&network);

        let remote: SocketAddr = ([10, 0, 0, 6], 6881).into();
        let remote_id = Id::random();
        let pong = Message {
            transaction_id: 9,
            message_type: MessageType::Response(ResponseSpecific::Ping {
                responder_id: remote_id,
            }),
        };
        network.deliver(
            remote,
            stack.connection().local_addr(),
            &pong.to_bytes(Family::Ipv4).unwrap(),
        );

        let received = stack.message_receiver().receive_message().unwrap();

        assert_eq!(received, Received::Ignored);
        assert!(!lock(stack.routing_table()).contains(&remote_id));
        assert_eq!(
            stack.message_receiver().receive_message().unwrap(),
            Received::Nothing
        );
    }
}

//! Outgoing message queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{lock, Id, Link, Shared};
use crate::transport::Connection;
use crate::Result;

use super::{Message, MessageTracker, MessageType, TrackerEntry};

#[derive(Debug)]
struct Outgoing {
    message: Message,
    to: SocketAddr,
    remote_id: Option<Id>,
    timeout: Duration,
}

#[derive(Debug)]
/// Queues messages and sends them on the next interaction tick.
pub struct MessageDispatcher {
    queue: VecDeque<Outgoing>,
    timeout: Duration,

    message_tracker: Link<Mutex<MessageTracker>>,
}

impl MessageDispatcher {
    /// `timeout` is the default time a query waits for its response.
    pub fn new(timeout: Duration) -> Self {
        MessageDispatcher {
            queue: VecDeque::new(),
            timeout,
            message_tracker: Link::new("message_dispatcher.message_tracker"),
        }
    }

    // === Wiring ===

    pub fn wire_message_tracker(&self, tracker: &Shared<MessageTracker>) -> Result<()> {
        self.message_tracker.wire(tracker)
    }

    pub fn ensure_wired(&self) -> Result<()> {
        self.message_tracker.ensure_wired()
    }

    // === Getters ===

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    // === Public Methods ===

    pub fn add_message(&mut self, message: Message, to: SocketAddr, remote_id: Option<Id>) {
        let timeout = self.timeout;
        self.add_message_with_timeout(message, to, remote_id, timeout);
    }

    pub fn add_message_with_timeout(
        &mut self,
        message: Message,
        to: SocketAddr,
        remote_id: Option<Id>,
        timeout: Duration,
    ) {
        self.queue.push_back(Outgoing {
            message,
            to,
            remote_id,
            timeout,
        });
    }

    /// Sends every queued message, registering queries with the tracker.
    ///
    /// Returns the number of messages sent.
    pub fn send_messages(&mut self, connection: &Connection) -> usize {
        let tracker = self.message_tracker.get();
        let mut sent = 0;

        while let Some(outgoing) = self.queue.pop_front() {
            let bytes = match outgoing.message.to_bytes(connection.family()) {
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(?error, message = ?outgoing.message, "Failed to encode message");
                    continue;
                }
            };

            if let Err(error) = connection.send_message(&bytes, outgoing.to) {
                debug!(?error, to = ?outgoing.to, "Error sending message");
                continue;
            }
            sent += 1;

            if let (MessageType::Request(request), Some(tracker)) =
                (&outgoing.message.message_type, &tracker)
            {
                lock(tracker).add_message(TrackerEntry {
                    transaction_id: outgoing.message.transaction_id,
                    to: outgoing.to,
                    remote_id: outgoing.remote_id,
                    method: request.method(),
                    sent_at: Instant::now(),
                    timeout: outgoing.timeout,
                });
            }
        }

        sent
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::common::Family;
    use crate::messages::{RequestSpecific, ResponseSpecific};
    use crate::transport::udp::sim::Network;

    #[test]
    fn queries_are_tracked() {
        let network = Network::new();
        let connection = Connection::bind(&network.binder(), Family::Ipv4, None, 6881).unwrap();
        let remote: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        network.occupy(remote);

        let tracker = Arc::new(Mutex::new(MessageTracker::new()));
        let mut dispatcher = MessageDispatcher::new(Duration::from_secs(10));
        dispatcher.wire_message_tracker(&tracker).unwrap();

        dispatcher.add_message(
            Message {
                transaction_id: 1,
                message_type: MessageType::Request(RequestSpecific::Ping {
                    requester_id: Id::random(),
                }),
            },
            remote,
            None,
        );
        dispatcher.add_message(
            Message {
                transaction_id: 2,
                message_type: MessageType::Response(ResponseSpecific::Ping {
                    responder_id: Id::random(),
                }),
            },
            remote,
            None,
        );

        assert_eq!(dispatcher.send_messages(&connection), 2);
        assert_eq!(dispatcher.count(), 0);
        assert_eq!(lock(&tracker).count(), 1);
        assert_eq!(network.take(&remote).len(), 2);
    }

    #[test]
    fn other_family_destination_is_dropped() {
        let network = Network::new();
        let connection = Connection::bind(&network.binder(), Family::Ipv4, None, 6881).unwrap();

        let mut dispatcher = MessageDispatcher::new(Duration::from_secs(10));
        dispatcher.add_message(
            Message {
                transaction_id: 1,
                message_type: MessageType::Request(RequestSpecific::Ping {
                    requester_id: Id::random(),
                }),
            },
            "[::1]:7000".parse().unwrap(),
            None,
        );

        assert_eq!(dispatcher.send_messages(&connection), 0);
        assert_eq!(dispatcher.count(), 0);
    }
}

//! Builds queries and answers incoming ones.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::debug;

use crate::common::{lock, Family, Link, LocalNode, Shared};
use crate::routing_table::RoutingTable;
use crate::server::{PeerAnnounceStorage, TokenTracker};
use crate::Result;

use super::{ErrorSpecific, Message, MessageDispatcher, MessageType, RequestSpecific, ResponseSpecific};

#[derive(Debug)]
pub struct MessageFactory {
    family: Family,
    next_transaction_id: AtomicU16,

    routing_table: Link<Mutex<RoutingTable>>,
    message_dispatcher: Link<Mutex<MessageDispatcher>>,
    peer_announce_storage: Link<Mutex<PeerAnnounceStorage>>,
    token_tracker: Link<Mutex<TokenTracker>>,
    local_node: Link<LocalNode>,
}

impl MessageFactory {
    pub fn new(family: Family) -> Self {
        MessageFactory {
            family,
            next_transaction_id: AtomicU16::new(rand::thread_rng().gen()),
            routing_table: Link::new("message_factory.routing_table"),
            message_dispatcher: Link::new("message_factory.message_dispatcher"),
            peer_announce_storage: Link::new("message_factory.peer_announce_storage"),
            token_tracker: Link::new("message_factory.token_tracker"),
            local_node: Link::new("message_factory.local_node"),
        }
    }

    // === Wiring ===

    pub fn wire_routing_table(&self, routing_table: &Shared<RoutingTable>) -> Result<()> {
        self.routing_table.wire(routing_table)
    }

    pub fn wire_message_dispatcher(&self, dispatcher: &Shared<MessageDispatcher>) -> Result<()> {
        self.message_dispatcher.wire(dispatcher)
    }

    pub fn wire_peer_announce_storage(&self, storage: &Shared<PeerAnnounceStorage>) -> Result<()> {
        self.peer_announce_storage.wire(storage)
    }

    pub fn wire_token_tracker(&self, token_tracker: &Shared<TokenTracker>) -> Result<()> {
        self.token_tracker.wire(token_tracker)
    }

    pub fn wire_local_node(&self, local_node: &Arc<LocalNode>) -> Result<()> {
        self.local_node.wire(local_node)
    }

    pub fn ensure_wired(&self) -> Result<()> {
        self.routing_table.ensure_wired()?;
        self.message_dispatcher.ensure_wired()?;
        self.peer_announce_storage.ensure_wired()?;
        self.token_tracker.ensure_wired()?;
        self.local_node.ensure_wired()
    }

    // === Getters ===

    pub fn family(&self) -> Family {
        self.family
    }

    // === Public Methods ===

    /// Wraps a request in a message with a fresh transaction id.
    pub fn create_query(&self, request: RequestSpecific) -> Message {
        Message {
            transaction_id: self.next_transaction_id.fetch_add(1, Ordering::Relaxed),
            message_type: MessageType::Request(request),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Message> {
        Message::from_bytes(bytes, self.family)
    }

    /// Answers an incoming request through the dispatcher.
    pub fn handle_request(
        &self,
        request: &RequestSpecific,
        transaction_id: u16,
        from: SocketAddr,
    ) -> Result<()> {
        let response = self.create_response(request, from)?;

        lock(&*self.message_dispatcher.require()?).add_message(
            Message {
                transaction_id,
                message_type: response,
            },
            from,
            None,
        );

        Ok(())
    }

    pub fn create_response(&self, request: &RequestSpecific, from: SocketAddr) -> Result<MessageType> {
        let responder_id = *self.local_node.require()?.id();

        let response = match request {
            RequestSpecific::Ping { .. } => ResponseSpecific::Ping { responder_id },
            RequestSpecific::FindNode { target, .. } => ResponseSpecific::FindNode {
                responder_id,
                nodes: lock(&*self.routing_table.require()?).closest(target),
            },
            RequestSpecific::GetPeers { info_hash, .. } => {
                let token = lock(&*self.token_tracker.require()?).generate_token(info_hash, from);
                let nodes = lock(&*self.routing_table.require()?).closest(info_hash);
                let values = lock(&*self.peer_announce_storage.require()?).get_peers(info_hash);

                ResponseSpecific::GetPeers {
                    responder_id,
                    token: token.to_vec(),
                    nodes,
                    values,
                }
            }
            RequestSpecific::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => {
                if !lock(&*self.token_tracker.require()?).validate(info_hash, from, token) {
                    debug!(?from, ?token, "Invalid token");

                    return Ok(MessageType::Error(ErrorSpecific {
                        code: 203,
                        description: "Bad token".to_string(),
                    }));
                }

                let peer = if *implied_port {
                    from
                } else {
                    SocketAddr::new(from.ip(), *port)
                };
                lock(&*self.peer_announce_storage.require()?).add_peer(*info_hash, peer);

                ResponseSpecific::Ping { responder_id }
            }
        };

        Ok(MessageType::Response(response))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::Id;

    struct Fixture {
        factory: MessageFactory,
        local_node: Arc<LocalNode>,
        storage: Shared<PeerAnnounceStorage>,
        token_tracker: Shared<TokenTracker>,
        _routing_table: Shared<RoutingTable>,
        _dispatcher: Shared<MessageDispatcher>,
    }

    fn fixture() -> Fixture {
        let local_node = Arc::new(LocalNode::new());
        let routing_table = Arc::new(Mutex::new(RoutingTable::new(Family::Ipv4, &local_node)));
        let dispatcher = Arc::new(Mutex::new(MessageDispatcher::new(
            std::time::Duration::from_secs(10),
        )));
        let storage = Arc::new(Mutex::new(PeerAnnounceStorage::new()));
        let token_tracker = Arc::new(Mutex::new(TokenTracker::new()));

        let factory = MessageFactory::new(Family::Ipv4);
        factory.wire_routing_table(&routing_table).unwrap();
        factory.wire_message_dispatcher(&dispatcher).unwrap();
        factory.wire_peer_announce_storage(&storage).unwrap();
        factory.wire_token_tracker(&token_tracker).unwrap();
        factory.wire_local_node(&local_node).unwrap();

        Fixture {
            factory,
            local_node,
            storage,
            token_tracker,
            _routing_table: routing_table,
            _dispatcher: dispatcher,
        }
    }

    #[test]
    fn transaction_ids_are_unique() {
        let fixture = fixture();
        let request = RequestSpecific::Ping {
            requester_id: Id::random(),
        };

        let a = fixture.factory.create_query(request.clone());
        let b = fixture.factory.create_query(request);

        assert_ne!(a.transaction_id, b.transaction_id);
    }

    #[test]
    fn ping_response() {
        let fixture = fixture();

        let response = fixture
            .factory
            .create_response(
                &RequestSpecific::Ping {
                    requester_id: Id::random(),
                },
                "1.1.1.1:1".parse().unwrap(),
            )
            .unwrap();

        assert_eq!(
            response,
            MessageType::Response(ResponseSpecific::Ping {
                responder_id: *fixture.local_node.id()
            })
        );
    }

    #[test]
    fn announce_with_valid_token() {
        let fixture = fixture();
        let from: SocketAddr = "1.1.1.1:6881".parse().unwrap();
        let info_hash = Id::random();
        let token = lock(&fixture.token_tracker).generate_token(&info_hash, from).to_vec();

        let response = fixture
            .factory
            .create_response(
                &RequestSpecific::AnnouncePeer {
                    requester_id: Id::random(),
                    info_hash,
                    port: 51413,
                    implied_port: false,
                    token,
                },
                from,
            )
            .unwrap();

        assert!(matches!(response, MessageType::Response(ResponseSpecific::Ping { .. })));
        assert_eq!(
            lock(&fixture.storage).get_peers(&info_hash),
            vec!["1.1.1.1:51413".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn announce_with_bad_token() {
        let fixture = fixture();
        let info_hash = Id::random();

        let response = fixture
            .factory
            .create_response(
                &RequestSpecific::AnnouncePeer {
                    requester_id: Id::random(),
                    info_hash,
                    port: 51413,
                    implied_port: true,
                    token: vec![0, 0, 0, 0],
                },
                "1.1.1.1:6881".parse().unwrap(),
            )
            .unwrap();

        assert!(matches!(response, MessageType::Error(ErrorSpecific { code: 203, .. })));
        assert!(lock(&fixture.storage).get_peers(&info_hash).is_empty());
    }

    #[test]
    fn unwired_factory_fails() {
        let factory = MessageFactory::new(Family::Ipv4);

        assert!(factory.ensure_wired().is_err());
        assert!(factory
            .create_response(
                &RequestSpecific::Ping {
                    requester_id: Id::random()
                },
                "1.1.1.1:1".parse().unwrap()
            )
            .is_err());
    }
}

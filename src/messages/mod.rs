//! KRPC messages and the services that send, receive and correlate them.

pub mod dispatcher;
pub mod factory;
mod internal;
pub mod receiver;
pub mod tracker;

use std::net::SocketAddr;

use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

use crate::common::{
    address_to_compact, compact_to_address, compact_to_nodes, nodes_to_compact, Family, Id, Node,
};
use crate::{Error, Result};

use internal::{DHTArguments, DHTMessage};

pub use dispatcher::MessageDispatcher;
pub use factory::MessageFactory;
pub use receiver::{MessageReceiver, Received};
pub use tracker::{MessageTracker, TrackerEntry};

const VERSION: [u8; 4] = [68, 66, 0, 1]; // "DB" version 01

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u16,
    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),
    Response(ResponseSpecific),
    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping {
        requester_id: Id,
    },
    FindNode {
        requester_id: Id,
        target: Id,
    },
    GetPeers {
        requester_id: Id,
        info_hash: Id,
    },
    AnnouncePeer {
        requester_id: Id,
        info_hash: Id,
        port: u16,
        implied_port: bool,
        token: Vec<u8>,
    },
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping {
        responder_id: Id,
    },
    FindNode {
        responder_id: Id,
        nodes: Vec<Node>,
    },
    GetPeers {
        responder_id: Id,
        token: Vec<u8>,
        nodes: Vec<Node>,
        values: Vec<SocketAddr>,
    },
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i64,
    pub description: String,
}

impl RequestSpecific {
    /// The KRPC method name.
    pub fn method(&self) -> &'static str {
        match self {
            RequestSpecific::Ping { .. } => "ping",
            RequestSpecific::FindNode { .. } => "find_node",
            RequestSpecific::GetPeers { .. } => "get_peers",
            RequestSpecific::AnnouncePeer { .. } => "announce_peer",
        }
    }

    pub fn requester_id(&self) -> &Id {
        match self {
            RequestSpecific::Ping { requester_id }
            | RequestSpecific::FindNode { requester_id, .. }
            | RequestSpecific::GetPeers { requester_id, .. }
            | RequestSpecific::AnnouncePeer { requester_id, .. } => requester_id,
        }
    }
}

impl ResponseSpecific {
    pub fn responder_id(&self) -> &Id {
        match self {
            ResponseSpecific::Ping { responder_id }
            | ResponseSpecific::FindNode { responder_id, .. }
            | ResponseSpecific::GetPeers { responder_id, .. } => responder_id,
        }
    }
}

impl Message {
    /// The id of the node that authored this message, if it carries one.
    pub fn author_id(&self) -> Option<&Id> {
        match &self.message_type {
            MessageType::Request(request) => Some(request.requester_id()),
            MessageType::Response(response) => Some(response.responder_id()),
            MessageType::Error(_) => None,
        }
    }

    pub fn to_bytes(&self, family: Family) -> Result<Vec<u8>> {
        self.to_wire(family).to_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T, family: Family) -> Result<Message> {
        Message::from_wire(DHTMessage::from_bytes(bytes)?, family)
    }

    fn to_wire(&self, family: Family) -> DHTMessage {
        let mut message = DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            message_type: String::new(),
            method: None,
            arguments: None,
            response: None,
            error_info: None,
            version: Some(ByteBuf::from(VERSION.to_vec())),
        };

        match &self.message_type {
            MessageType::Request(request) => {
                message.message_type = "q".to_string();
                message.method = Some(request.method().to_string());
                message.arguments = Some(request_arguments(request));
            }
            MessageType::Response(response) => {
                message.message_type = "r".to_string();
                message.response = Some(response_values(response, family));
            }
            MessageType::Error(error) => {
                message.message_type = "e".to_string();
                message.error_info = Some(vec![
                    Value::Int(error.code),
                    Value::Bytes(error.description.as_bytes().to_vec()),
                ]);
            }
        }

        message
    }

    fn from_wire(message: DHTMessage, family: Family) -> Result<Message> {
        let transaction_id = transaction_id(&message.transaction_id)?;

        let message_type = match message.message_type.as_str() {
            "q" => {
                let arguments = message
                    .arguments
                    .ok_or(Error::InvalidMessage("query without arguments"))?;
                let method = message
                    .method
                    .ok_or(Error::InvalidMessage("query without method"))?;

                MessageType::Request(parse_request(&method, arguments)?)
            }
            "r" => {
                let values = message
                    .response
                    .ok_or(Error::InvalidMessage("response without values"))?;

                MessageType::Response(parse_response(values, family)?)
            }
            "e" => {
                let info = message.error_info.unwrap_or_default();
                let code = match info.first() {
                    Some(Value::Int(code)) => *code,
                    _ => 0,
                };
                let description = match info.get(1) {
                    Some(Value::Bytes(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
                    _ => String::new(),
                };

                MessageType::Error(ErrorSpecific { code, description })
            }
            _ => return Err(Error::InvalidMessage("unknown message type")),
        };

        Ok(Message {
            transaction_id,
            message_type,
        })
    }
}

fn transaction_id(bytes: &[u8]) -> Result<u16> {
    match bytes {
        [byte] => Ok(*byte as u16),
        [high, low] => Ok(u16::from_be_bytes([*high, *low])),
        _ => Err(Error::InvalidMessage("transaction id is not one or two bytes")),
    }
}

fn request_arguments(request: &RequestSpecific) -> DHTArguments {
    let mut arguments = DHTArguments {
        id: request.requester_id().to_vec(),
        ..Default::default()
    };

    match request {
        RequestSpecific::Ping { .. } => {}
        RequestSpecific::FindNode { target, .. } => {
            arguments.target = Some(ByteBuf::from(target.to_vec()));
        }
        RequestSpecific::GetPeers { info_hash, .. } => {
            arguments.info_hash = Some(ByteBuf::from(info_hash.to_vec()));
        }
        RequestSpecific::AnnouncePeer {
            info_hash,
            port,
            implied_port,
            token,
            ..
        } => {
            arguments.info_hash = Some(ByteBuf::from(info_hash.to_vec()));
            arguments.port = Some(*port);
            arguments.implied_port = implied_port.then_some(1);
            arguments.token = Some(ByteBuf::from(token.clone()));
        }
    }

    arguments
}

fn response_values(response: &ResponseSpecific, family: Family) -> DHTArguments {
    let mut values = DHTArguments {
        id: response.responder_id().to_vec(),
        ..Default::default()
    };

    let nodes = match response {
        ResponseSpecific::Ping { .. } => None,
        ResponseSpecific::FindNode { nodes, .. } => Some(nodes),
        ResponseSpecific::GetPeers {
            token,
            nodes,
            values: peers,
            ..
        } => {
            values.token = Some(ByteBuf::from(token.clone()));
            if !peers.is_empty() {
                values.values = Some(
                    peers
                        .iter()
                        .map(|peer| ByteBuf::from(address_to_compact(peer)))
                        .collect(),
                );
            }
            Some(nodes)
        }
    };

    if let Some(nodes) = nodes {
        let compact = Some(ByteBuf::from(nodes_to_compact(nodes)));
        match family {
            Family::Ipv4 => values.nodes = compact,
            Family::Ipv6 => values.nodes6 = compact,
        }
    }

    values
}

fn parse_request(method: &str, arguments: DHTArguments) -> Result<RequestSpecific> {
    let requester_id = Id::from_bytes(&arguments.id)?;
    let id_argument = |value: Option<ByteBuf>, missing: &'static str| -> Result<Id> {
        Id::from_bytes(value.ok_or(Error::InvalidMessage(missing))?)
    };

    Ok(match method {
        "ping" => RequestSpecific::Ping { requester_id },
        "find_node" => RequestSpecific::FindNode {
            requester_id,
            target: id_argument(arguments.target, "find_node without target")?,
        },
        "get_peers" => RequestSpecific::GetPeers {
            requester_id,
            info_hash: id_argument(arguments.info_hash, "get_peers without info_hash")?,
        },
        "announce_peer" => RequestSpecific::AnnouncePeer {
            requester_id,
            info_hash: id_argument(arguments.info_hash, "announce_peer without info_hash")?,
            port: arguments.port.unwrap_or_default(),
            implied_port: arguments.implied_port.unwrap_or_default() != 0,
            token: arguments
                .token
                .ok_or(Error::InvalidMessage("announce_peer without token"))?
                .into_vec(),
        },
        _ => return Err(Error::InvalidMessage("unknown method")),
    })
}

fn parse_response(values: DHTArguments, family: Family) -> Result<ResponseSpecific> {
    let responder_id = Id::from_bytes(&values.id)?;

    let compact = match family {
        Family::Ipv4 => values.nodes,
        Family::Ipv6 => values.nodes6,
    };
    let nodes = match compact {
        Some(bytes) => Some(compact_to_nodes(&bytes, family)?),
        None => None,
    };

    Ok(match (values.token, nodes) {
        (Some(token), nodes) => ResponseSpecific::GetPeers {
            responder_id,
            token: token.into_vec(),
            nodes: nodes.unwrap_or_default(),
            values: values
                .values
                .unwrap_or_default()
                .iter()
                .map(|peer| compact_to_address(peer))
                .collect::<Result<_>>()?,
        },
        (None, Some(nodes)) => ResponseSpecific::FindNode {
            responder_id,
            nodes,
        },
        (None, None) => ResponseSpecific::Ping { responder_id },
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(address: &str) -> Node {
        Node::new(Id::random(), address.parse().unwrap())
    }

    #[test]
    fn find_node_response_v6() {
        let message = Message {
            transaction_id: 258,
            message_type: MessageType::Response(ResponseSpecific::FindNode {
                responder_id: Id::random(),
                nodes: vec![node("[2001:db8::1]:6881"), node("[2001:db8::2]:6882")],
            }),
        };

        let bytes = message.to_bytes(Family::Ipv6).unwrap();
        assert!(bytes.windows(6).any(|w| w == b"nodes6"));

        assert_eq!(Message::from_bytes(bytes, Family::Ipv6).unwrap(), message);
    }

    #[test]
    fn get_peers_response_with_values() {
        let message = Message {
            transaction_id: 7,
            message_type: MessageType::Response(ResponseSpecific::GetPeers {
                responder_id: Id::random(),
                token: vec![1, 2, 3, 4],
                nodes: vec![node("1.1.1.1:1")],
                values: vec!["2.2.2.2:2".parse().unwrap()],
            }),
        };

        let bytes = message.to_bytes(Family::Ipv4).unwrap();

        assert_eq!(Message::from_bytes(bytes, Family::Ipv4).unwrap(), message);
    }

    #[test]
    fn announce_peer_request() {
        let message = Message {
            transaction_id: 1,
            message_type: MessageType::Request(RequestSpecific::AnnouncePeer {
                requester_id: Id::random(),
                info_hash: Id::random(),
                port: 51413,
                implied_port: true,
                token: vec![9, 9],
            }),
        };

        let bytes = message.to_bytes(Family::Ipv4).unwrap();

        assert_eq!(Message::from_bytes(bytes, Family::Ipv4).unwrap(), message);
    }

    #[test]
    fn error_message() {
        let message = Message {
            transaction_id: 3,
            message_type: MessageType::Error(ErrorSpecific {
                code: 203,
                description: "Bad token".to_string(),
            }),
        };

        let bytes = message.to_bytes(Family::Ipv4).unwrap();

        assert_eq!(Message::from_bytes(bytes, Family::Ipv4).unwrap(), message);
    }

    #[test]
    fn reject_unknown_method() {
        let bytes = b"d1:ad2:id20:abcdefghij0123456789e1:q4:vote1:t2:aa1:y1:qe";

        assert!(matches!(
            Message::from_bytes(bytes, Family::Ipv4),
            Err(Error::InvalidMessage("unknown method"))
        ));
    }

    #[test]
    fn reject_garbage() {
        assert!(Message::from_bytes(b"not bencode", Family::Ipv4).is_err());
    }
}

//! Struct and implementation of the Node entry in the Kademlia routing table
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::common::{Family, Id, ID_SIZE};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
/// Node entry in Kademlia routing table
pub struct Node {
    pub id: Id,
    pub address: SocketAddr,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Node {
        Node { id, address }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn family(&self) -> Family {
        Family::of(&self.address)
    }

    /// Compact node info: 20 bytes id followed by the compact address.
    pub fn to_compact(&self) -> Vec<u8> {
        let mut bytes = self.id.to_vec();
        bytes.extend(address_to_compact(&self.address));
        bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
/// This node's identity in one DHT network.
pub struct LocalNode {
    id: Id,
    port: u16,
}

impl LocalNode {
    /// A fresh identity with a random id and no port yet.
    pub fn new() -> Self {
        Self::with_id(Id::random())
    }

    pub fn with_id(id: Id) -> Self {
        LocalNode { id, port: 0 }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The advertised UDP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }
}

impl Default for LocalNode {
    fn default() -> Self {
        Self::new()
    }
}

pub fn address_to_compact(address: &SocketAddr) -> Vec<u8> {
    let mut bytes = match address.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend(address.port().to_be_bytes());

    bytes
}

pub fn compact_to_address(bytes: &[u8]) -> Result<SocketAddr> {
    let (ip, port) = match bytes.len() {
        6 => {
            let octets: [u8; 4] = bytes[..4]
                .try_into()
                .map_err(|_| Error::Compact("wrong number of bytes for ip"))?;
            (IpAddr::V4(Ipv4Addr::from(octets)), &bytes[4..])
        }
        18 => {
            let octets: [u8; 16] = bytes[..16]
                .try_into()
                .map_err(|_| Error::Compact("wrong number of bytes for ip"))?;
            (IpAddr::V6(Ipv6Addr::from(octets)), &bytes[16..])
        }
        _ => return Err(Error::Compact("wrong number of bytes for compact address")),
    };

    Ok(SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]])))
}

/// Concatenated compact node infos of one family.
pub fn nodes_to_compact(nodes: &[Node]) -> Vec<u8> {
    nodes.iter().flat_map(|node| node.to_compact()).collect()
}

pub fn compact_to_nodes(bytes: &[u8], family: Family) -> Result<Vec<Node>> {
    let size = ID_SIZE + family.compact_address_len();
    if bytes.len() % size != 0 {
        return Err(Error::Compact("wrong number of bytes for compact nodes"));
    }

    bytes
        .chunks_exact(size)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = compact_to_address(&chunk[ID_SIZE..])?;
            Ok(Node::new(id, address))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_nodes_v4() {
        let nodes = vec![
            Node::new(Id::random(), "1.2.3.4:6881".parse().unwrap()),
            Node::new(Id::random(), "5.6.7.8:51413".parse().unwrap()),
        ];

        let bytes = nodes_to_compact(&nodes);
        assert_eq!(bytes.len(), 2 * 26);
        assert_eq!(compact_to_nodes(&bytes, Family::Ipv4).unwrap(), nodes);
    }

    #[test]
    fn compact_nodes_v6() {
        let nodes = vec![Node::new(Id::random(), "[2001:db8::1]:6881".parse().unwrap())];

        let bytes = nodes_to_compact(&nodes);
        assert_eq!(bytes.len(), 38);
        assert_eq!(compact_to_nodes(&bytes, Family::Ipv6).unwrap(), nodes);
    }

    #[test]
    fn compact_nodes_truncated() {
        let node = Node::new(Id::random(), "1.2.3.4:6881".parse().unwrap());
        let bytes = node.to_compact();

        assert!(compact_to_nodes(&bytes[..25], Family::Ipv4).is_err());
        assert!(compact_to_nodes(&bytes, Family::Ipv6).is_err());
    }

    #[test]
    fn local_node_port() {
        let mut local = LocalNode::new();
        assert_eq!(local.port(), 0);

        local.set_port(6881);
        assert_eq!(local.port(), 6881);
    }
}

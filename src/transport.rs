//! UDP transport of one DHT stack.

pub mod udp;

use std::io;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, trace};

use crate::common::Family;
use crate::{Error, Result};

use udp::{Bind, Udp};

/// Maximum size of a DHT datagram.
pub const MTU: usize = 2048;

#[derive(Debug)]
/// A UDP socket bound for one address family.
pub struct Connection {
    family: Family,
    socket: Box<dyn Udp>,
    local_addr: SocketAddr,
}

impl Connection {
    /// Binds exactly `port` on `address`, or the family's unspecified address.
    pub fn bind(
        binder: &dyn Bind,
        family: Family,
        address: Option<IpAddr>,
        port: u16,
    ) -> Result<Self> {
        let address = listen_address(family, address, port)?;
        let socket = binder.bind(address)?;

        Self::from_socket(family, socket)
    }

    /// Tries each candidate port strictly in order, returning the first
    /// successful bind.
    pub fn bind_candidates(
        binder: &dyn Bind,
        family: Family,
        address: Option<IpAddr>,
        candidates: &[u16],
    ) -> Result<Self> {
        for &port in candidates {
            match Self::bind(binder, family, address, port) {
                Ok(connection) => return Ok(connection),
                Err(Error::IO(error)) => {
                    debug!(%family, port, ?error, "Failed to bind DHT UDP port");
                }
                Err(error) => return Err(error),
            }
        }

        Err(Error::PortsExhausted(candidates.len()))
    }

    fn from_socket(family: Family, socket: Box<dyn Udp>) -> Result<Self> {
        let local_addr = socket.local_addr()?;

        debug!(%family, ?local_addr, "Bound DHT UDP socket");

        Ok(Connection {
            family,
            socket,
            local_addr,
        })
    }

    // === Getters ===

    pub fn family(&self) -> Family {
        self.family
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    // === Public Methods ===

    pub fn send_message(&self, bytes: &[u8], to: SocketAddr) -> Result<usize> {
        if !self.family.matches(&to) {
            return Err(Error::UnsupportedAddress(to));
        }
        trace!(?to, size = bytes.len(), "Sending datagram");

        Ok(self.socket.send_to(bytes, to)?)
    }

    /// Reads one datagram, `None` if nothing is waiting on the socket.
    pub fn receive_message(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((size, from)) => Ok(Some((size, from))),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// A second handle to the socket for the host loop to watch for
    /// readability.
    pub fn readiness_handle(&self) -> Result<ReadinessHandle> {
        Ok(ReadinessHandle(self.socket.try_clone()?))
    }
}

#[derive(Debug)]
/// Socket handle a run loop polls before driving the interaction command.
pub struct ReadinessHandle(Box<dyn Udp>);

impl ReadinessHandle {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.0.local_addr()?)
    }
}

fn listen_address(family: Family, address: Option<IpAddr>, port: u16) -> Result<SocketAddr> {
    let address = SocketAddr::new(address.unwrap_or_else(|| family.unspecified()), port);
    if !family.matches(&address) {
        return Err(Error::UnsupportedAddress(address));
    }

    Ok(address)
}

#[cfg(test)]
mod test {
    use super::udp::sim::Network;
    use super::*;

    #[test]
    fn bind_exact_port() {
        let network = Network::new();

        let connection = Connection::bind(&network.binder(), Family::Ipv4, None, 6881).unwrap();

        assert_eq!(connection.port(), 6881);
        assert_eq!(connection.local_addr(), "0.0.0.0:6881".parse().unwrap());
    }

    #[test]
    fn first_free_candidate() {
        let network = Network::new();
        network.occupy("0.0.0.0:6881".parse().unwrap());

        let connection =
            Connection::bind_candidates(&network.binder(), Family::Ipv4, None, &[6881, 6882, 6883])
                .unwrap();

        assert_eq!(connection.port(), 6882);
        assert_eq!(
            network.bind_attempts(),
            vec![
                "0.0.0.0:6881".parse().unwrap(),
                "0.0.0.0:6882".parse().unwrap()
            ]
        );
    }

    #[test]
    fn candidates_exhausted() {
        let network = Network::new();
        network.occupy("[::]:6881".parse().unwrap());

        let result = Connection::bind_candidates(&network.binder(), Family::Ipv6, None, &[6881]);

        assert!(matches!(result, Err(Error::PortsExhausted(1))));
    }

    #[test]
    fn wrong_family_listen_address() {
        let network = Network::new();

        let result = Connection::bind(
            &network.binder(),
            Family::Ipv6,
            Some("127.0.0.1".parse().unwrap()),
            6881,
        );

        assert!(matches!(result, Err(Error::UnsupportedAddress(_))));
        assert!(network.bind_attempts().is_empty());
    }

    #[test]
    fn receive_would_block() {
        let network = Network::new();
        let connection = Connection::bind(&network.binder(), Family::Ipv4, None, 6881).unwrap();

        let mut buf = [0_u8; MTU];
        assert!(connection.receive_message(&mut buf).unwrap().is_none());

        network.deliver(
            "1.2.3.4:1000".parse().unwrap(),
            connection.local_addr(),
            b"d1:y1:qe",
        );
        let (size, from) = connection.receive_message(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..size], b"d1:y1:qe");
        assert_eq!(from, "1.2.3.4:1000".parse().unwrap());
    }
}

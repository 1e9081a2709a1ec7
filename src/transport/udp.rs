use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;

/// A bound UDP socket.
pub trait Udp: Debug + Send + Sync {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    /// Another handle to the same socket, used to watch it for readiness.
    fn try_clone(&self) -> io::Result<Box<dyn Udp>>;
}

/// Opens [Udp] sockets.
pub trait Bind: Debug + Send + Sync {
    fn bind(&self, address: SocketAddr) -> io::Result<Box<dyn Udp>>;
}

pub mod real {
    use super::*;

    #[derive(Debug)]
    pub struct UdpSocket(pub(crate) std::net::UdpSocket);

    impl UdpSocket {
        /// Binds a non-blocking socket.
        pub fn bind(addr: SocketAddr) -> io::Result<Box<Self>> {
            let socket = std::net::UdpSocket::bind(addr)?;
            socket.set_nonblocking(true)?;

            Ok(Box::new(Self(socket)))
        }
    }

    impl Udp for UdpSocket {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.0.recv_from(buf)
        }
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.0.send_to(buf, addr)
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.0.local_addr()
        }
        fn try_clone(&self) -> io::Result<Box<dyn Udp>> {
            Ok(Box::new(Self(self.0.try_clone()?)))
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    /// Binds operating system sockets.
    pub struct Binder;

    impl Bind for Binder {
        fn bind(&self, address: SocketAddr) -> io::Result<Box<dyn Udp>> {
            Ok(UdpSocket::bind(address)?)
        }
    }
}

pub mod sim {
    //! In-memory sockets, every [Network] is isolated from the others.

    pub use super::*;

    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use crate::common::{lock, Family};

    type ChannelMessage = (Box<[u8]>, SocketAddr);

    const EPHEMERAL_PORTS_START: u16 = 49152;

    #[derive(Debug, Default)]
    struct Channel {
        handles: usize,
        messages: VecDeque<ChannelMessage>,
    }

    #[derive(Debug, Default)]
    struct State {
        channels: HashMap<SocketAddr, Channel>,
        bind_attempts: Vec<SocketAddr>,
        fail_clones: bool,
        next_ephemeral: u16,
    }

    impl State {
        fn in_use(&self, address: &SocketAddr) -> bool {
            self.channels.keys().any(|bound| {
                bound.port() == address.port() && Family::of(bound) == Family::of(address)
            })
        }
    }

    #[derive(Debug, Clone, Default)]
    /// A simulated UDP network.
    pub struct Network(Arc<Mutex<State>>);

    impl Network {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn binder(&self) -> Binder {
            Binder(self.clone())
        }

        /// Marks `address` as taken by another process.
        pub fn occupy(&self, address: SocketAddr) {
            lock(&self.0)
                .channels
                .entry(address)
                .or_default()
                .handles += 1;
        }

        /// Makes every following [Udp::try_clone] fail.
        pub fn fail_clones(&self, fail: bool) {
            lock(&self.0).fail_clones = fail;
        }

        /// Every address a bind was attempted on, in order.
        pub fn bind_attempts(&self) -> Vec<SocketAddr> {
            lock(&self.0).bind_attempts.clone()
        }

        pub fn is_bound(&self, address: &SocketAddr) -> bool {
            lock(&self.0).channels.contains_key(address)
        }

        /// Delivers a datagram to `to` as if it was sent from `from`.
        pub fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
            if let Some(channel) = lock(&self.0).channels.get_mut(&to) {
                channel.messages.push_back((bytes.into(), from));
            }
        }

        /// Drains the datagrams queued for `address`.
        pub fn take(&self, address: &SocketAddr) -> Vec<ChannelMessage> {
            lock(&self.0)
                .channels
                .get_mut(address)
                .map(|channel| channel.messages.drain(..).collect())
                .unwrap_or_default()
        }
    }

    #[derive(Debug, Clone)]
    pub struct Binder(Network);

    impl Bind for Binder {
        fn bind(&self, address: SocketAddr) -> io::Result<Box<dyn Udp>> {
            let mut state = lock(&(self.0).0);
            state.bind_attempts.push(address);

            let mut local_addr = address;
            if address.port() == 0 {
                let offset = state.next_ephemeral;
                state.next_ephemeral = offset.wrapping_add(1) % (u16::MAX - EPHEMERAL_PORTS_START);
                local_addr.set_port(EPHEMERAL_PORTS_START + offset);
            }

            if state.in_use(&local_addr) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is already in use", local_addr),
                ));
            }

            state.channels.entry(local_addr).or_default().handles += 1;

            Ok(Box::new(UdpSocket {
                network: self.0.clone(),
                local_addr,
            }))
        }
    }

    #[derive(Debug)]
    pub struct UdpSocket {
        network: Network,
        local_addr: SocketAddr,
    }

    impl Drop for UdpSocket {
        fn drop(&mut self) {
            let mut state = lock(&self.network.0);
            if let Some(channel) = state.channels.get_mut(&self.local_addr) {
                channel.handles -= 1;
                if channel.handles == 0 {
                    state.channels.remove(&self.local_addr);
                }
            }
        }
    }

    impl Udp for UdpSocket {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let mut state = lock(&self.network.0);
            let channel = state
                .channels
                .get_mut(&self.local_addr)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

            match channel.messages.pop_front() {
                Some((message, from)) => {
                    let size = message.len().min(buf.len());
                    buf[..size].copy_from_slice(&message[..size]);

                    Ok((size, from))
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            // Packets to unbound addresses are sent to the void.
            self.network.deliver(self.local_addr, addr, buf);

            Ok(buf.len())
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local_addr)
        }
        fn try_clone(&self) -> io::Result<Box<dyn Udp>> {
            let mut state = lock(&self.network.0);
            if state.fail_clones {
                return Err(io::Error::other("udp::sim::UdpSocket clone refused"));
            }
            if let Some(channel) = state.channels.get_mut(&self.local_addr) {
                channel.handles += 1;
            }

            Ok(Box::new(UdpSocket {
                network: self.network.clone(),
                local_addr: self.local_addr,
            }))
        }
    }

}

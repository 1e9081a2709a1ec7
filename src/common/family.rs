//! Address families a DHT stack can run on.

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Raw address family code for IPv4, as used by the socket API.
pub const AF_INET: i32 = 2;
/// Raw address family code for IPv6, as used by the socket API.
pub const AF_INET6: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// One of the two independent Mainline DHT networks.
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Ipv4, Family::Ipv6];

    /// The raw address family code.
    pub fn raw(&self) -> i32 {
        match self {
            Family::Ipv4 => AF_INET,
            Family::Ipv6 => AF_INET6,
        }
    }

    /// The wildcard address to listen on when no listen address is configured.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            Family::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn of(address: &SocketAddr) -> Family {
        match address {
            SocketAddr::V4(_) => Family::Ipv4,
            SocketAddr::V6(_) => Family::Ipv6,
        }
    }

    /// Returns `true` if `address` belongs to this family.
    pub fn matches(&self, address: &SocketAddr) -> bool {
        Family::of(address) == *self
    }

    /// Size of a compact "ip + port" record.
    pub fn compact_address_len(&self) -> usize {
        match self {
            Family::Ipv4 => 6,
            Family::Ipv6 => 18,
        }
    }
}

impl TryFrom<i32> for Family {
    type Error = i32;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            AF_INET => Ok(Family::Ipv4),
            AF_INET6 => Ok(Family::Ipv6),
            other => Err(other),
        }
    }
}

impl Display for Family {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Family::Ipv4 => write!(f, "IPv4"),
            Family::Ipv6 => write!(f, "IPv6"),
        }
    }
}

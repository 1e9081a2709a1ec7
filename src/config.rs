use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::Family;
use crate::{Error, Result};

/// Default candidate ports for the DHT UDP socket.
pub const DEFAULT_LISTEN_PORTS: &str = "6881-6999";
/// Default timeout before abandoning a query to a non-responding node.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ENTRY_POINT_PORT: u16 = 6881;

#[derive(Debug, Clone)]
/// Dht Configurations, shared by both address families.
pub struct Config {
    /// Candidate ports tried in order when no UDP port was negotiated yet.
    ///
    /// Defaults to [DEFAULT_LISTEN_PORTS]
    pub listen_ports: Vec<u16>,
    /// Timeout of a single DHT query.
    ///
    /// The longer this duration is, the longer lookups take until they are deemeed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_MESSAGE_TIMEOUT]
    pub message_timeout: Duration,
    /// Options of the IPv4 DHT.
    pub ipv4: FamilyConfig,
    /// Options of the IPv6 DHT.
    pub ipv6: FamilyConfig,
}

#[derive(Debug, Clone, PartialEq)]
/// Options of one DHT network.
pub struct FamilyConfig {
    /// Where the routing table and local node id are persisted.
    pub state_file: PathBuf,
    /// Address to bind the UDP socket to.
    ///
    /// Defaults to None, where the unspecified address of the family is used.
    pub listen_address: Option<IpAddr>,
    /// Node used once to join the network.
    ///
    /// Defaults to None, where the node stays passively reachable.
    pub entry_point: Option<EntryPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Well known bootstrapping `host:port`.
pub struct EntryPoint {
    pub host: String,
    pub port: u16,
}

impl EntryPoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        EntryPoint {
            host: host.into(),
            port,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ports: parse_port_segments(DEFAULT_LISTEN_PORTS).unwrap_or_default(),
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            ipv4: FamilyConfig::new("dht.dat"),
            ipv6: FamilyConfig::new("dht6.dat"),
        }
    }
}

impl Config {
    // === Options ===

    pub fn with_listen_ports(mut self, ports: Vec<u16>) -> Self {
        self.listen_ports = ports;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_state_file(mut self, family: Family, path: impl Into<PathBuf>) -> Self {
        self.family_mut(family).state_file = path.into();
        self
    }

    pub fn with_listen_address(mut self, family: Family, address: IpAddr) -> Self {
        self.family_mut(family).listen_address = Some(address);
        self
    }

    pub fn with_entry_point(mut self, family: Family, entry_point: EntryPoint) -> Self {
        self.family_mut(family).entry_point = Some(entry_point);
        self
    }

    // === Getters ===

    pub fn family(&self, family: Family) -> &FamilyConfig {
        match family {
            Family::Ipv4 => &self.ipv4,
            Family::Ipv6 => &self.ipv6,
        }
    }

    pub fn family_mut(&mut self, family: Family) -> &mut FamilyConfig {
        match family {
            Family::Ipv4 => &mut self.ipv4,
            Family::Ipv6 => &mut self.ipv6,
        }
    }
}

impl FamilyConfig {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        FamilyConfig {
            state_file: state_file.into(),
            listen_address: None,
            entry_point: None,
        }
    }
}

/// Parses a port option like `6881-6889,6999` into a sorted list of unique ports.
///
/// An empty option yields no candidates.
pub fn parse_port_segments(segments: &str) -> Result<Vec<u16>> {
    let invalid = || Error::InvalidPortSegments(segments.to_string());
    let mut ports = Vec::new();

    for segment in segments.split(',').map(str::trim) {
        if segment.is_empty() {
            if segments.trim().is_empty() {
                continue;
            }
            return Err(invalid());
        }

        match segment.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start.trim().parse().map_err(|_| invalid())?;
                let end: u16 = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                ports.extend(start..=end);
            }
            None => ports.push(segment.parse().map_err(|_| invalid())?),
        }
    }

    ports.sort_unstable();
    ports.dedup();

    Ok(ports)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_listen_ports() {
        let config = Config::default();

        assert_eq!(config.listen_ports.len(), 119);
        assert_eq!(config.listen_ports.first(), Some(&6881));
        assert_eq!(config.listen_ports.last(), Some(&6999));
        assert_eq!(config.message_timeout, DEFAULT_MESSAGE_TIMEOUT);
        assert!(config.ipv4.entry_point.is_none());
    }

    #[test]
    fn port_segments() {
        assert_eq!(
            parse_port_segments("7000, 6881-6883,6882").unwrap(),
            vec![6881, 6882, 6883, 7000]
        );
        assert_eq!(parse_port_segments("").unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn invalid_port_segments() {
        for input in ["6881-", "abc", "6890-6881", "70000", "6881,,6882"] {
            assert!(
                matches!(parse_port_segments(input), Err(Error::InvalidPortSegments(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn per_family_options() {
        let config = Config::default()
            .with_state_file(Family::Ipv6, "/tmp/state6")
            .with_entry_point(Family::Ipv4, EntryPoint::new("router.bittorrent.com", 6881));

        assert_eq!(config.family(Family::Ipv6).state_file, PathBuf::from("/tmp/state6"));
        assert_eq!(config.family(Family::Ipv4).state_file, PathBuf::from("dht.dat"));
        assert!(config.family(Family::Ipv4).entry_point.is_some());
        assert!(config.family(Family::Ipv6).entry_point.is_none());
    }
}

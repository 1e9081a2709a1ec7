//! Persisted local node id and routing table of one DHT network.
//!
//! The file is a bencoded dictionary:
//!
//! | key | value |
//! |-----|-------|
//! | `v` | format version |
//! | `f` | raw address family |
//! | `id`| local node id, 20 bytes |
//! | `n` | compact node infos |
//! | `t` | unix time of the save |
//! | `c` | CRC-32C of the fields above |

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{compact_to_nodes, nodes_to_compact, Family, Id, LocalNode, Node};
use crate::{Error, Result};

const VERSION: i64 = 3;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct StateFile {
    #[serde(rename = "v")]
    version: i64,
    #[serde(rename = "f")]
    family: i64,
    #[serde(with = "serde_bytes")]
    id: Vec<u8>,
    #[serde(rename = "n", with = "serde_bytes")]
    nodes: Vec<u8>,
    #[serde(rename = "t")]
    saved_at: i64,
    #[serde(rename = "c")]
    checksum: i64,
}

impl StateFile {
    fn checksum(&self) -> i64 {
        let mut digest = CASTAGNOLI.digest();

        digest.update(&self.version.to_be_bytes());
        digest.update(&self.family.to_be_bytes());
        digest.update(&self.id);
        digest.update(&self.nodes);
        digest.update(&self.saved_at.to_be_bytes());

        digest.finalize() as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Everything recovered from a state file.
pub struct Snapshot {
    /// The identity used in the previous run, if any.
    pub local_node: Option<LocalNode>,
    /// Peers known in the previous run.
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Copy)]
/// Reads state files of one family.
pub struct StateLoader {
    family: Family,
}

impl StateLoader {
    pub fn new(family: Family) -> Self {
        StateLoader { family }
    }

    /// Reads and validates the state file at `path`, never returning a partial snapshot.
    pub fn load(&self, path: &Path) -> Result<Snapshot> {
        let bytes = fs::read(path)?;
        let file: StateFile = serde_bencode::from_bytes(&bytes)?;

        if file.version != VERSION {
            return Err(Error::StateFile("unsupported version"));
        }
        if file.family != self.family.raw() as i64 {
            return Err(Error::StateFile("address family mismatch"));
        }
        if file.checksum != file.checksum() {
            return Err(Error::StateFile("checksum mismatch"));
        }

        let local_node = if file.id.is_empty() {
            None
        } else {
            Some(LocalNode::with_id(Id::from_bytes(&file.id)?))
        };
        let nodes = compact_to_nodes(&file.nodes, self.family)?;

        debug!(family = %self.family, ?path, nodes = nodes.len(), "Loaded DHT state");

        Ok(Snapshot { local_node, nodes })
    }
}

#[derive(Debug, Clone, Copy)]
/// Writes state files of one family.
pub struct StateSaver {
    family: Family,
}

impl StateSaver {
    pub fn new(family: Family) -> Self {
        StateSaver { family }
    }

    /// Atomically replaces the state file at `path`.
    ///
    /// Nodes of the other family are skipped.
    pub fn save(&self, path: &Path, local_node: &LocalNode, nodes: &[Node]) -> Result<()> {
        let nodes: Vec<Node> = nodes
            .iter()
            .filter(|node| node.family() == self.family)
            .cloned()
            .collect();

        let saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();

        let mut file = StateFile {
            version: VERSION,
            family: self.family.raw() as i64,
            id: local_node.id().to_vec(),
            nodes: nodes_to_compact(&nodes),
            saved_at,
            checksum: 0,
        };
        file.checksum = file.checksum();

        let bytes = serde_bencode::to_bytes(&file)?;

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        debug!(family = %self.family, ?path, nodes = nodes.len(), "Saved DHT state");

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn nodes_v4(count: u8) -> Vec<Node> {
        (0..count)
            .map(|i| Node::new(Id::random(), ([10, 0, 0, i], 6881).into()))
            .collect()
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.dat");

        let local = LocalNode::new();
        let nodes = nodes_v4(5);

        StateSaver::new(Family::Ipv4)
            .save(&path, &local, &nodes)
            .unwrap();
        let snapshot = StateLoader::new(Family::Ipv4).load(&path).unwrap();

        assert_eq!(snapshot.local_node.as_ref().map(|l| *l.id()), Some(*local.id()));
        assert_eq!(snapshot.nodes, nodes);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let result = StateLoader::new(Family::Ipv4).load(&dir.path().join("nope"));

        assert!(matches!(result, Err(Error::IO(_))));
    }

    #[test]
    fn corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.dat");
        fs::write(&path, b"definitely not bencode").unwrap();

        assert!(StateLoader::new(Family::Ipv4).load(&path).is_err());
    }

    #[test]
    fn tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.dat");
        StateSaver::new(Family::Ipv4)
            .save(&path, &LocalNode::new(), &nodes_v4(1))
            .unwrap();

        let mut file: StateFile = serde_bencode::from_bytes(&fs::read(&path).unwrap()).unwrap();
        file.nodes[0] ^= 0xff;
        fs::write(&path, serde_bencode::to_bytes(&file).unwrap()).unwrap();

        assert!(matches!(
            StateLoader::new(Family::Ipv4).load(&path),
            Err(Error::StateFile("checksum mismatch"))
        ));
    }

    #[test]
    fn other_family_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.dat");
        StateSaver::new(Family::Ipv4)
            .save(&path, &LocalNode::new(), &nodes_v4(2))
            .unwrap();

        assert!(matches!(
            StateLoader::new(Family::Ipv6).load(&path),
            Err(Error::StateFile("address family mismatch"))
        ));
    }

    #[test]
    fn save_skips_other_family() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht6.dat");

        let mut nodes = nodes_v4(2);
        let v6 = Node::new(Id::random(), "[2001:db8::1]:6881".parse().unwrap());
        nodes.push(v6.clone());

        StateSaver::new(Family::Ipv6)
            .save(&path, &LocalNode::new(), &nodes)
            .unwrap();

        let snapshot = StateLoader::new(Family::Ipv6).load(&path).unwrap();
        assert_eq!(snapshot.nodes, vec![v6]);
    }
}

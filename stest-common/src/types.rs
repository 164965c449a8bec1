//! Common types used across stest components.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Role a node plays in the replication pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Exposes the virtual device and generates change logs.
    Storage,
    /// Forwards change logs to archives.
    Proxy,
    /// Materializes restorable snapshots.
    Archive,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Proxy => write!(f, "proxy"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

/// Network endpoint of a node's control port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A cluster node. Immutable once the topology is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub role: NodeRole,
    pub endpoint: Endpoint,
    /// Backing storage group, archives only (volume group in LVM terms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_group: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, role: NodeRole, endpoint: Endpoint) -> Self {
        Self {
            name: NodeName::new(name),
            role,
            endpoint,
            archive_group: None,
        }
    }

    pub fn storage(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(name, NodeRole::Storage, Endpoint::new(host, port))
    }

    pub fn proxy(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(name, NodeRole::Proxy, Endpoint::new(host, port))
    }

    pub fn archive(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        group: impl Into<String>,
    ) -> Self {
        Self {
            archive_group: Some(group.into()),
            ..Self::new(name, NodeRole::Archive, Endpoint::new(host, port))
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}@{})", self.name, self.role, self.endpoint)
    }
}

/// Block device a storage node exposes for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub id: String,
    /// Path of the device node, e.g. `/dev/walb/0`.
    pub path: PathBuf,
    /// Underlying data extent.
    pub data_extent: PathBuf,
    /// Underlying log extent.
    pub log_extent: PathBuf,
    /// Nominal size in MiB.
    pub size_mb: u64,
}

impl VirtualDevice {
    /// Size in bytes, or `None` when `size_mb` does not fit a byte count.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size_mb.checked_mul(1024 * 1024)
    }
}

/// Generation id: totally ordered token for a point in a volume's change stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Gid(pub u64);

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Gid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Gid)
    }
}

/// Ordered gids an archive can currently restore for one volume.
pub type RestorablePointSet = Vec<Gid>;

/// Which restorable points to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorableFilter {
    /// Clean snapshots only.
    #[default]
    Clean,
    /// Every restorable point, including those inside unmerged diffs.
    All,
}

/// Content digest of a device or restored image.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub Vec<u8>);

impl Digest {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// How a node stops serving a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    #[default]
    Graceful,
    /// Stop immediately, dropping in-flight work.
    Force,
    /// Proxy only: stop after the forwarding queue drains.
    Empty,
}

impl std::fmt::Display for StopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::Force => write!(f, "force"),
            Self::Empty => write!(f, "empty"),
        }
    }
}

/// How a node process shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    #[default]
    Graceful,
    Force,
}

impl std::fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::Force => write!(f, "force"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_ordering_and_parse() {
        let a: Gid = "12".parse().unwrap();
        let b: Gid = " 40\n".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "40");
        assert!("x".parse::<Gid>().is_err());
    }

    #[test]
    fn test_gid_serializes_transparently() {
        let json = serde_json::to_string(&vec![Gid(1), Gid(5)]).unwrap();
        assert_eq!(json, "[1,5]");
    }

    #[test]
    fn test_digest_hex() {
        let d = Digest(vec![0x00, 0xab, 0x10]);
        assert_eq!(d.to_hex(), "00ab10");
        assert_eq!(format!("{d:?}"), "Digest(00ab10)");
    }

    #[test]
    fn test_archive_node_carries_group() {
        let a0 = Node::archive("a0", "localhost", 10200, "vg0");
        assert_eq!(a0.role, NodeRole::Archive);
        assert_eq!(a0.archive_group.as_deref(), Some("vg0"));
        assert_eq!(a0.to_string(), "a0(archive@localhost:10200)");
    }
}

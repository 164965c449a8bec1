//! Cluster topology: nodes per role, virtual devices and volumes.
//!
//! A [`Topology`] is built once per suite run and is read-only afterwards.
//! Every other component refers to nodes by [`NodeName`] and resolves them
//! here.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::types::{Endpoint, Node, NodeName, NodeRole, VirtualDevice};

/// Immutable cluster layout.
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    storage: Vec<Node>,
    proxy: Vec<Node>,
    archive: Vec<Node>,
    devices: Vec<VirtualDevice>,
    /// Volume name -> device id.
    volumes: BTreeMap<String, String>,
    debug: bool,
    work_dir: PathBuf,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Nodes of one role, in declaration order.
    pub fn nodes(&self, role: NodeRole) -> &[Node] {
        match role {
            NodeRole::Storage => &self.storage,
            NodeRole::Proxy => &self.proxy,
            NodeRole::Archive => &self.archive,
        }
    }

    /// Storage, proxy, then archive nodes.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.storage
            .iter()
            .chain(self.proxy.iter())
            .chain(self.archive.iter())
    }

    /// The first archive receives full and hash backups.
    pub fn primary_archive(&self) -> &Node {
        // build() rejects topologies without archives
        &self.archive[0]
    }

    pub fn node(&self, name: &str) -> Result<&Node, ConfigError> {
        self.all_nodes()
            .find(|n| n.name.as_str() == name)
            .ok_or_else(|| ConfigError::UnknownNode(name.to_string()))
    }

    /// Look a node up and check its role.
    pub fn node_with_role(&self, name: &str, role: NodeRole) -> Result<&Node, ConfigError> {
        let node = self.node(name)?;
        if node.role != role {
            return Err(ConfigError::WrongRole {
                node: name.to_string(),
                expected: role.to_string(),
                actual: node.role.to_string(),
            });
        }
        Ok(node)
    }

    /// Resolve a list of names, preserving order.
    pub fn resolve<'a, I, S>(&self, names: I) -> Result<Vec<&Node>, ConfigError>
    where
        I: IntoIterator<Item = &'a S>,
        S: AsRef<str> + ?Sized + 'a,
    {
        names
            .into_iter()
            .map(|name| self.node(name.as_ref()))
            .collect()
    }

    pub fn devices(&self) -> &[VirtualDevice] {
        &self.devices
    }

    pub fn volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes.keys().map(String::as_str)
    }

    /// Device backing a volume at the storage role.
    pub fn device_for(&self, volume: &str) -> Result<&VirtualDevice, ConfigError> {
        let id = self
            .volumes
            .get(volume)
            .ok_or_else(|| ConfigError::UnknownVolume(volume.to_string()))?;
        self.devices
            .iter()
            .find(|d| &d.id == id)
            .ok_or_else(|| ConfigError::UnknownDevice {
                volume: volume.to_string(),
                device: id.clone(),
            })
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Parse a topology from TOML text.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let file: TopologyFile = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        file.into_builder().build()
    }

    /// Load a topology file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text, path)
    }
}

/// Builder collecting node descriptors before validation.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    nodes: Vec<Node>,
    devices: Vec<VirtualDevice>,
    volumes: BTreeMap<String, String>,
    debug: bool,
    work_dir: Option<PathBuf>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(self, name: &str, host: &str, port: u16) -> Self {
        self.node(Node::storage(name, host, port))
    }

    pub fn proxy(self, name: &str, host: &str, port: u16) -> Self {
        self.node(Node::proxy(name, host, port))
    }

    pub fn archive(self, name: &str, host: &str, port: u16, group: &str) -> Self {
        self.node(Node::archive(name, host, port, group))
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn device(mut self, device: VirtualDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn volume(mut self, volume: impl Into<String>, device_id: impl Into<String>) -> Self {
        self.volumes.insert(volume.into(), device_id.into());
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Validate and freeze the topology.
    pub fn build(self) -> Result<Topology, ConfigError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode(node.name.to_string()));
            }
            validate_endpoint(&node.name, &node.endpoint)?;
            if let Some(group) = &node.archive_group
                && group.trim().is_empty()
            {
                return Err(ConfigError::EmptyArchiveGroup(node.name.to_string()));
            }
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
            if device.size_bytes().is_none() {
                return Err(ConfigError::InvalidSetting {
                    setting: "device size_mb",
                    reason: format!("{} MiB for device {} is too large", device.size_mb, device.id),
                });
            }
        }
        for (volume, device) in &self.volumes {
            if !device_ids.contains(device.as_str()) {
                return Err(ConfigError::UnknownDevice {
                    volume: volume.clone(),
                    device: device.clone(),
                });
            }
        }

        let by_role = |role: NodeRole| -> Vec<Node> {
            self.nodes
                .iter()
                .filter(|n| n.role == role)
                .cloned()
                .collect()
        };
        let storage = by_role(NodeRole::Storage);
        let proxy = by_role(NodeRole::Proxy);
        let archive = by_role(NodeRole::Archive);
        for (role, nodes) in [
            (NodeRole::Storage, &storage),
            (NodeRole::Proxy, &proxy),
            (NodeRole::Archive, &archive),
        ] {
            if nodes.is_empty() {
                return Err(ConfigError::MissingRole(role.to_string()));
            }
        }

        Ok(Topology {
            storage,
            proxy,
            archive,
            devices: self.devices,
            volumes: self.volumes,
            debug: self.debug,
            work_dir: self
                .work_dir
                .unwrap_or_else(|| std::env::temp_dir().join("stest")),
        })
    }
}

fn validate_endpoint(node: &NodeName, endpoint: &Endpoint) -> Result<(), ConfigError> {
    let reason = if endpoint.host.trim().is_empty() {
        Some("empty host")
    } else if endpoint.host.chars().any(char::is_whitespace) {
        Some("host contains whitespace")
    } else if endpoint.port == 0 {
        Some("port 0")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::MalformedEndpoint {
            node: node.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

// ── File format ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NodeEntry {
    name: String,
    #[serde(default = "default_host")]
    host: String,
    port: u16,
    #[serde(default)]
    group: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    work_dir: Option<PathBuf>,
    #[serde(default)]
    storage: Vec<NodeEntry>,
    #[serde(default)]
    proxy: Vec<NodeEntry>,
    #[serde(default)]
    archive: Vec<NodeEntry>,
    #[serde(default)]
    device: Vec<VirtualDevice>,
    #[serde(default)]
    volumes: BTreeMap<String, String>,
}

impl TopologyFile {
    fn into_builder(self) -> TopologyBuilder {
        let mut builder = Topology::builder().debug(self.debug);
        if let Some(dir) = self.work_dir {
            builder = builder.work_dir(dir);
        }
        for (role, entries) in [
            (NodeRole::Storage, self.storage),
            (NodeRole::Proxy, self.proxy),
            (NodeRole::Archive, self.archive),
        ] {
            for entry in entries {
                let mut node = Node::new(entry.name, role, Endpoint::new(entry.host, entry.port));
                node.archive_group = entry.group;
                builder = builder.node(node);
            }
        }
        for device in self.device {
            builder = builder.device(device);
        }
        for (volume, device) in self.volumes {
            builder = builder.volume(volume, device);
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> VirtualDevice {
        VirtualDevice {
            id: id.to_string(),
            path: PathBuf::from(format!("/dev/walb/{id}")),
            data_extent: PathBuf::from("/dev/test/data"),
            log_extent: PathBuf::from("/dev/test/log"),
            size_mb: 12,
        }
    }

    fn base() -> TopologyBuilder {
        Topology::builder()
            .node(Node::storage("s0", "localhost", 10000))
            .node(Node::proxy("p0", "localhost", 10100))
            .node(Node::archive("a0", "localhost", 10200, "vg0"))
            .device(device("0"))
            .volume("vol0", "0")
    }

    #[test]
    fn test_build_orders_nodes_by_role() {
        let topo = base()
            .node(Node::archive("a1", "localhost", 10201, "vg1"))
            .node(Node::storage("s1", "localhost", 10001))
            .build()
            .unwrap();
        let names: Vec<_> = topo.all_nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["s0", "s1", "p0", "a0", "a1"]);
        assert_eq!(topo.primary_archive().name.as_str(), "a0");
    }

    #[test]
    fn test_duplicate_names_rejected_across_roles() {
        let err = base()
            .node(Node::proxy("s0", "localhost", 10101))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateNode("s0".into()));
    }

    #[test]
    fn test_empty_archive_group_rejected() {
        let err = base()
            .node(Node::archive("a1", "localhost", 10201, "  "))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptyArchiveGroup("a1".into()));
    }

    #[test]
    fn test_malformed_endpoint_rejected() {
        let err = base()
            .node(Node::proxy("p1", "", 10101))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedEndpoint { .. }));

        let err = base()
            .node(Node::proxy("p1", "localhost", 0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedEndpoint { .. }));
    }

    #[test]
    fn test_missing_role_rejected() {
        let err = Topology::builder()
            .node(Node::storage("s0", "localhost", 10000))
            .node(Node::archive("a0", "localhost", 10200, "vg0"))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingRole("proxy".into()));
    }

    #[test]
    fn test_volume_must_reference_known_device() {
        let err = base().volume("vol1", "9").build().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDevice { .. }));
    }

    #[test]
    fn test_oversized_device_rejected() {
        let mut huge = device("1");
        huge.size_mb = u64::MAX / 1024;
        let err = base().device(huge).build().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                setting: "device size_mb",
                ..
            }
        ));
        assert_eq!(device("0").size_bytes(), Some(12 * 1024 * 1024));
    }

    #[test]
    fn test_role_shorthands() {
        let topo = TopologyBuilder::new()
            .storage("s0", "localhost", 10000)
            .proxy("p0", "localhost", 10100)
            .archive("a0", "localhost", 10200, "vg0")
            .device(device("0"))
            .volume("vol0", "0")
            .build()
            .unwrap();
        let reference = base().build().unwrap();
        assert!(topo.all_nodes().eq(reference.all_nodes()));
    }

    #[test]
    fn test_node_with_role() {
        let topo = base().build().unwrap();
        assert!(topo.node_with_role("a0", NodeRole::Archive).is_ok());
        let err = topo.node_with_role("p0", NodeRole::Archive).unwrap_err();
        assert!(matches!(err, ConfigError::WrongRole { .. }));
        assert_eq!(
            topo.node("x9").unwrap_err(),
            ConfigError::UnknownNode("x9".into())
        );
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
            debug = true
            work_dir = "/tmp/stest-work"

            [[storage]]
            name = "s0"
            port = 10000

            [[proxy]]
            name = "p0"
            port = 10100

            [[archive]]
            name = "a0"
            port = 10200
            group = "vg0"

            [[device]]
            id = "0"
            path = "/dev/walb/0"
            data_extent = "/dev/test/data"
            log_extent = "/dev/test/log"
            size_mb = 12

            [volumes]
            vol0 = "0"
        "#;
        let topo = Topology::from_toml_str(text, Path::new("topology.toml")).unwrap();
        assert!(topo.debug());
        assert_eq!(topo.work_dir(), Path::new("/tmp/stest-work"));
        assert_eq!(topo.nodes(NodeRole::Storage)[0].endpoint.host, "localhost");
        assert_eq!(
            topo.device_for("vol0").unwrap().path,
            PathBuf::from("/dev/walb/0")
        );
    }

    #[test]
    fn test_from_toml_parse_error_names_file() {
        let err = Topology::from_toml_str("[[storage]]\nname = 3", Path::new("bad.toml"))
            .unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, PathBuf::from("bad.toml")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

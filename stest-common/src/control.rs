//! Cluster control facade consumed by the harness.
//!
//! [`ClusterControl`] is the typed contract for remote commands against
//! nodes. The harness never retries a call; retry policy, if any, belongs to
//! the implementation. Traits use native `async fn` and are consumed
//! generically.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::{ControlResult, HarnessError, HarnessResult};
use crate::process::NodeProcesses;
use crate::topology::Topology;
use crate::types::{Gid, Node, RestorableFilter, ShutdownMode, StopMode};

/// Remote control operations, each addressed to one node and a volume.
#[allow(async_fn_in_trait)]
pub trait ClusterControl {
    /// Attach `device` to `volume` on a storage node.
    async fn init(&self, storage: &Node, volume: &str, device: &Path) -> ControlResult<()>;

    /// Ship a full image to the primary archive.
    async fn full_backup(&self, storage: &Node, volume: &str) -> ControlResult<Gid>;

    /// Reconcile storage and archive by content hashing.
    async fn hash_backup(&self, storage: &Node, volume: &str) -> ControlResult<Gid>;

    /// Take a snapshot and wait until every archive in `archives` can restore it.
    async fn snapshot_sync(
        &self,
        storage: &Node,
        volume: &str,
        archives: &[&Node],
    ) -> ControlResult<Gid>;

    /// Take a snapshot without waiting for delivery.
    async fn snapshot_async(&self, storage: &Node, volume: &str) -> ControlResult<Gid>;

    async fn apply_diff(&self, archive: &Node, volume: &str, gid: Gid) -> ControlResult<()>;

    async fn merge_diff(
        &self,
        archive: &Node,
        volume: &str,
        begin: Gid,
        end: Gid,
    ) -> ControlResult<()>;

    async fn replicate(
        &self,
        src: &Node,
        volume: &str,
        dst: &Node,
        synchronizing: bool,
    ) -> ControlResult<()>;

    async fn start_sync(&self, archive: &Node, volume: &str) -> ControlResult<()>;

    async fn stop_sync(&self, archive: &Node, volume: &str) -> ControlResult<()>;

    /// Grow the volume on every node that holds it.
    async fn resize(&self, volume: &str, size_mb: u64, zero_clear: bool) -> ControlResult<()>;

    async fn stop(&self, node: &Node, volume: &str, mode: StopMode) -> ControlResult<()>;

    async fn start(&self, node: &Node, volume: &str) -> ControlResult<()>;

    async fn shutdown(&self, node: &Node, mode: ShutdownMode) -> ControlResult<()>;

    async fn startup(&self, node: &Node) -> ControlResult<()>;

    async fn get_state(&self, node: &Node, volume: &str) -> ControlResult<String>;

    async fn list_restorable(
        &self,
        archive: &Node,
        volume: &str,
        filter: RestorableFilter,
    ) -> ControlResult<Vec<Gid>>;

    async fn get_latest_clean_snapshot(&self, archive: &Node, volume: &str) -> ControlResult<Gid>;

    async fn remove_persistent_data(&self, node: &Node) -> ControlResult<()>;

    /// Materialize the image of `volume` at `gid`; returns its path.
    async fn restore(&self, archive: &Node, volume: &str, gid: Gid) -> ControlResult<PathBuf>;

    async fn delete_restored(&self, archive: &Node, volume: &str, gid: Gid) -> ControlResult<()>;
}

/// Rebuilds the cluster before a suite repetition.
#[allow(async_fn_in_trait)]
pub trait ClusterBootstrap {
    async fn reset(&self, topology: &Topology, processes: &mut NodeProcesses)
    -> HarnessResult<()>;
}

/// Bootstrap that kills every node process and spawns a fresh one per node.
pub struct ProcessBootstrap<F> {
    command_for: F,
    startup_delay: Duration,
}

impl<F> ProcessBootstrap<F>
where
    F: Fn(&Node, &Topology) -> Command,
{
    /// `command_for` builds the command line of one node.
    pub fn new(command_for: F) -> Self {
        Self {
            command_for,
            startup_delay: Duration::ZERO,
        }
    }

    /// Wait this long after spawning for nodes to open their ports.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }
}

impl<F> ClusterBootstrap for ProcessBootstrap<F>
where
    F: Fn(&Node, &Topology) -> Command,
{
    async fn reset(
        &self,
        topology: &Topology,
        processes: &mut NodeProcesses,
    ) -> HarnessResult<()> {
        let released = processes.release_all();
        debug!(released, "killed previous node processes");
        let work_dir = topology.work_dir();
        let dir_error = |action: &'static str| {
            move |source: std::io::Error| HarnessError::WorkDir {
                path: work_dir.to_path_buf(),
                action,
                source,
            }
        };
        if work_dir.exists() {
            std::fs::remove_dir_all(work_dir).map_err(dir_error("clear"))?;
        }
        std::fs::create_dir_all(work_dir).map_err(dir_error("create"))?;

        for node in topology.all_nodes() {
            processes.spawn(&node.name, (self.command_for)(node, topology))?;
        }
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }
        info!(nodes = processes.len(), "cluster processes started");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::types::VirtualDevice;

    fn topology(dir: &Path) -> Topology {
        Topology::builder()
            .node(Node::storage("s0", "localhost", 10000))
            .node(Node::proxy("p0", "localhost", 10100))
            .node(Node::archive("a0", "localhost", 10200, "vg0"))
            .device(VirtualDevice {
                id: "0".into(),
                path: dir.join("wdev0"),
                data_extent: dir.join("data0"),
                log_extent: dir.join("log0"),
                size_mb: 1,
            })
            .volume("vol0", "0")
            .work_dir(dir.join("work"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_bootstrap_spawns_every_node() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topology(dir.path());
        let bootstrap = ProcessBootstrap::new(|_node: &Node, _topo: &Topology| {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            cmd
        });
        let mut procs = NodeProcesses::new();

        bootstrap.reset(&topo, &mut procs).await.unwrap();
        assert_eq!(procs.len(), 3);
        assert!(topo.work_dir().is_dir());
        for node in topo.all_nodes() {
            assert!(procs.is_running(&node.name), "{node}");
        }

        // A second reset replaces rather than accumulates.
        bootstrap.reset(&topo, &mut procs).await.unwrap();
        assert_eq!(procs.len(), 3);
        assert_eq!(procs.release_all(), 3);
    }

    #[tokio::test]
    async fn test_reset_fails_when_work_dir_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let topo = Topology::builder()
            .node(Node::storage("s0", "localhost", 10000))
            .node(Node::proxy("p0", "localhost", 10100))
            .node(Node::archive("a0", "localhost", 10200, "vg0"))
            .work_dir(blocker.join("work"))
            .build()
            .unwrap();
        let bootstrap = ProcessBootstrap::new(|_node: &Node, _topo: &Topology| {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            cmd
        });
        let mut procs = NodeProcesses::new();

        let err = bootstrap.reset(&topo, &mut procs).await.unwrap_err();
        assert!(matches!(err, HarnessError::WorkDir { action: "create", .. }));
        assert_eq!(err.kind(), ErrorKind::Process);
        assert!(err.to_string().contains("file/work"), "{err}");
        assert!(procs.is_empty());
    }
}

//! Owned collection of spawned node processes.
//!
//! The suite runner owns one [`NodeProcesses`] and hands it to the cluster
//! bootstrap before every repetition. Survivors are killed on teardown or on
//! drop.

use std::collections::BTreeMap;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::types::NodeName;

/// A spawned node process.
#[derive(Debug)]
pub struct NodeProcess {
    pub node: NodeName,
    pub pid: u32,
    pub started_at: Instant,
    child: Child,
}

impl NodeProcess {
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill and reap. Killing a process that already exited is not an error.
    fn kill(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.child.kill()?;
        self.child.wait()
    }
}

/// Node name to spawned child.
#[derive(Debug, Default)]
pub struct NodeProcesses {
    procs: BTreeMap<NodeName, NodeProcess>,
}

impl NodeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` as the process of `node`. A previous process of the
    /// same node is killed first.
    pub fn spawn(&mut self, node: &NodeName, mut command: Command) -> HarnessResult<u32> {
        self.kill(node)?;

        // Node logs go to their own files; inherited pipes would fill up.
        command.stdout(Stdio::null()).stderr(Stdio::null());
        let child = command.spawn().map_err(|source| HarnessError::Process {
            node: node.clone(),
            action: "spawn",
            source,
        })?;
        let pid = child.id();
        info!(node = %node, pid, "node process spawned");
        self.procs.insert(
            node.clone(),
            NodeProcess {
                node: node.clone(),
                pid,
                started_at: Instant::now(),
                child,
            },
        );
        Ok(pid)
    }

    /// Kill the process of `node`, if any. Returns whether one was tracked.
    pub fn kill(&mut self, node: &NodeName) -> HarnessResult<bool> {
        let Some(mut proc) = self.procs.remove(node) else {
            return Ok(false);
        };
        let status = proc.kill().map_err(|source| HarnessError::Process {
            node: node.clone(),
            action: "kill",
            source,
        })?;
        debug!(node = %node, pid = proc.pid, ?status, "node process stopped");
        Ok(true)
    }

    pub fn is_running(&mut self, node: &NodeName) -> bool {
        self.procs.get_mut(node).is_some_and(NodeProcess::is_running)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Kill every tracked process. Failures are logged and the rest are
    /// still released; returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let procs = std::mem::take(&mut self.procs);
        let count = procs.len();
        for (name, mut proc) in procs {
            match proc.kill() {
                Ok(status) => debug!(node = %name, pid = proc.pid, ?status, "released"),
                Err(e) => warn!(node = %name, pid = proc.pid, error = %e, "failed to kill"),
            }
        }
        if count > 0 {
            info!(count, "released node processes");
        }
        count
    }
}

impl Drop for NodeProcesses {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        cmd
    }

    #[test]
    fn test_spawn_kill_cycle() {
        let mut procs = NodeProcesses::new();
        let s0 = NodeName::from("s0");
        procs.spawn(&s0, sleeper()).unwrap();
        assert!(procs.is_running(&s0));
        assert_eq!(procs.len(), 1);

        assert!(procs.kill(&s0).unwrap());
        assert!(!procs.is_running(&s0));
        assert!(!procs.kill(&s0).unwrap());
    }

    #[test]
    fn test_respawn_replaces_previous() {
        let mut procs = NodeProcesses::new();
        let p0 = NodeName::from("p0");
        let first = procs.spawn(&p0, sleeper()).unwrap();
        let second = procs.spawn(&p0, sleeper()).unwrap();
        assert_ne!(first, second);
        assert_eq!(procs.len(), 1);
    }

    #[test]
    fn test_release_all_empties_collection() {
        let mut procs = NodeProcesses::new();
        for name in ["s0", "p0", "a0"] {
            procs.spawn(&NodeName::from(name), sleeper()).unwrap();
        }
        assert_eq!(procs.release_all(), 3);
        assert!(procs.is_empty());
        assert_eq!(procs.release_all(), 0);
    }

    #[test]
    fn test_spawn_failure_names_node() {
        let mut procs = NodeProcesses::new();
        let err = procs
            .spawn(
                &NodeName::from("a0"),
                Command::new("/nonexistent/stest-node-binary"),
            )
            .unwrap_err();
        assert!(matches!(err, HarnessError::Process { action: "spawn", .. }));
        assert!(err.to_string().contains("a0"));
    }
}

//! In-memory replication cluster.
//!
//! [`SimCluster`] implements [`ClusterControl`] over real device files so the
//! harness can run its scenarios without node binaries. It models the parts of
//! the pipeline the scenarios observe: per-node volume states, gid allocation,
//! snapshot delivery through a proxy to receiving archives (optionally lagged
//! by a number of polls), diff boundaries on storage stop, apply/merge, one-shot
//! and synchronizing replication, and archives that lose their data and need a
//! full or hash backup before they accept snapshots again.
//!
//! Calls are recorded, and failures can be scripted per node and operation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::control::{ClusterBootstrap, ClusterControl};
use crate::errors::{ControlError, ControlFailure, ControlResult, HarnessError, HarnessResult};
use crate::process::NodeProcesses;
use crate::topology::Topology;
use crate::types::{Gid, Node, NodeName, NodeRole, RestorableFilter, ShutdownMode, StopMode};

const CLEAR: &str = "Clear";
const SYNC_READY: &str = "SyncReady";
const MASTER: &str = "Master";
const STOPPED: &str = "Stopped";
const STARTED: &str = "Started";
const ARCHIVED: &str = "Archived";

const MIB: u64 = 1024 * 1024;

/// Operations a node accepts while its process is down.
const OFFLINE_OPERATIONS: [&str; 2] = ["startup", "remove_persistent_data"];

/// One recorded control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub node: NodeName,
    pub operation: &'static str,
    pub volume: Option<String>,
}

#[derive(Debug, Clone)]
struct ScriptedFailure {
    node: NodeName,
    operation: &'static str,
    failure: ControlFailure,
}

#[derive(Debug, Clone)]
struct Point {
    gid: Gid,
    clean: bool,
    image: Arc<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct StorageVol {
    device: PathBuf,
    state: &'static str,
    /// State restored by `start`.
    resume: &'static str,
}

#[derive(Debug, Clone)]
struct ArchiveVol {
    state: &'static str,
    points: Vec<Point>,
    /// New snapshots are shipped here.
    receiving: bool,
    sync_stopped: bool,
}

impl Default for ArchiveVol {
    fn default() -> Self {
        Self {
            state: CLEAR,
            points: Vec::new(),
            receiving: false,
            sync_stopped: false,
        }
    }
}

impl ArchiveVol {
    fn insert(&mut self, point: Point) {
        match self.points.binary_search_by_key(&point.gid, |p| p.gid) {
            Ok(_) => {}
            Err(pos) => self.points.insert(pos, point),
        }
    }

    fn point(&self, gid: Gid) -> Option<&Point> {
        self.points.iter().find(|p| p.gid == gid)
    }
}

#[derive(Debug, Clone)]
struct Pending {
    archive: NodeName,
    volume: String,
    point: Point,
    /// Polls left before delivery is attempted.
    wait: u32,
}

type VolKey = (NodeName, String);

#[derive(Debug, Default)]
struct SimState {
    down: HashSet<NodeName>,
    storage: HashMap<VolKey, StorageVol>,
    proxy_stopped: HashSet<VolKey>,
    archives: HashMap<VolKey, ArchiveVol>,
    next_gid: HashMap<String, u64>,
    pending: Vec<Pending>,
    scripted: Vec<ScriptedFailure>,
    calls: Vec<SimCall>,
}

fn key(node: &NodeName, volume: &str) -> VolKey {
    (node.clone(), volume.to_string())
}

impl SimState {
    fn alloc_gid(&mut self, volume: &str) -> Gid {
        let next = self.next_gid.entry(volume.to_string()).or_insert(0);
        let gid = Gid(*next);
        *next += 1;
        gid
    }

    fn archive(&self, node: &NodeName, volume: &str) -> Option<&ArchiveVol> {
        self.archives.get(&key(node, volume))
    }

    fn archive_mut(&mut self, node: &NodeName, volume: &str) -> &mut ArchiveVol {
        self.archives.entry(key(node, volume)).or_default()
    }

    fn archive_state(&self, node: &NodeName, volume: &str) -> &'static str {
        self.archive(node, volume).map_or(CLEAR, |a| a.state)
    }
}

/// In-memory cluster backed by device files.
pub struct SimCluster {
    topology: Topology,
    restore_dir: PathBuf,
    delivery_lag: u32,
    inner: Mutex<SimState>,
}

impl SimCluster {
    /// Restored images are written under `<work_dir>/restored`.
    pub fn new(topology: Topology) -> Self {
        let restore_dir = topology.work_dir().join("restored");
        Self {
            topology,
            restore_dir,
            delivery_lag: 0,
            inner: Mutex::new(SimState::default()),
        }
    }

    /// Asynchronous snapshots become visible only after `polls` restorable
    /// queries.
    pub fn with_delivery_lag(mut self, polls: u32) -> Self {
        self.delivery_lag = polls;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Fail the next `operation` addressed to `node`.
    pub fn inject_failure(&self, node: &str, operation: &'static str, failure: ControlFailure) {
        self.lock().scripted.push(ScriptedFailure {
            node: NodeName::from(node),
            operation,
            failure,
        });
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call<T>(
        &self,
        node: &Node,
        operation: &'static str,
        volume: Option<&str>,
        f: impl FnOnce(&mut SimState) -> ControlResult<T>,
    ) -> ControlResult<T> {
        let mut st = self.lock();
        st.calls.push(SimCall {
            node: node.name.clone(),
            operation,
            volume: volume.map(str::to_string),
        });
        if let Some(pos) = st
            .scripted
            .iter()
            .position(|s| s.node == node.name && s.operation == operation)
        {
            let scripted = st.scripted.remove(pos);
            return Err(ControlError::new(
                &node.name,
                operation,
                scripted.failure,
                "injected failure",
            ));
        }
        if !OFFLINE_OPERATIONS.contains(&operation) && st.down.contains(&node.name) {
            return Err(ControlError::new(
                &node.name,
                operation,
                ControlFailure::Transport,
                "node is down",
            ));
        }
        let result = f(&mut *st);
        match &result {
            Ok(_) => trace!(node = %node.name, operation, volume, "sim call ok"),
            Err(e) => debug!(node = %node.name, operation, volume, error = %e, "sim call failed"),
        }
        result
    }

    fn expect_role(node: &Node, role: NodeRole, operation: &'static str) -> ControlResult<()> {
        if node.role == role {
            Ok(())
        } else {
            Err(ControlError::rejected(
                &node.name,
                operation,
                format!("not a {role} node"),
            ))
        }
    }

    /// Why snapshots cannot currently reach `archive`, if they cannot.
    fn blocked(&self, st: &SimState, archive: &NodeName, volume: &str) -> Option<String> {
        let proxy_up = self.topology.nodes(NodeRole::Proxy).iter().any(|p| {
            !st.down.contains(&p.name) && !st.proxy_stopped.contains(&key(&p.name, volume))
        });
        if !proxy_up {
            return Some("no proxy is forwarding".to_string());
        }
        if st.down.contains(archive) {
            return Some(format!("{archive} is down"));
        }
        match st.archive(archive, volume) {
            None => Some(format!("{archive} has no data for {volume}")),
            Some(a) if a.state != ARCHIVED => Some(format!("{archive} is {}", a.state)),
            Some(a) if a.sync_stopped => Some(format!("{archive} stopped synchronizing")),
            Some(a) if !a.receiving => Some(format!("{archive} is not receiving")),
            Some(_) => None,
        }
    }

    /// Attempt delivery of queued snapshots.
    fn pump(&self, st: &mut SimState) {
        let mut keep = Vec::new();
        for mut p in std::mem::take(&mut st.pending) {
            if p.wait > 0 {
                p.wait -= 1;
                keep.push(p);
                continue;
            }
            if st.archive_state(&p.archive, &p.volume) == CLEAR {
                debug!(archive = %p.archive, gid = %p.point.gid, "dropping snapshot for cleared archive");
                continue;
            }
            if self.blocked(st, &p.archive, &p.volume).is_some() {
                keep.push(p);
                continue;
            }
            trace!(archive = %p.archive, gid = %p.point.gid, "snapshot delivered");
            st.archive_mut(&p.archive, &p.volume).insert(p.point);
        }
        st.pending = keep;
    }

    /// Queue `point` for every receiving archive.
    fn ship(&self, st: &mut SimState, volume: &str, point: &Point, except: &[&NodeName]) {
        for archive in self.topology.nodes(NodeRole::Archive) {
            if except.contains(&&archive.name) {
                continue;
            }
            if st.archive(&archive.name, volume).is_some_and(|a| a.receiving) {
                st.pending.push(Pending {
                    archive: archive.name.clone(),
                    volume: volume.to_string(),
                    point: point.clone(),
                    wait: self.delivery_lag,
                });
            }
        }
    }

    fn capture(
        &self,
        st: &mut SimState,
        storage: &Node,
        volume: &str,
        clean: bool,
        op: &'static str,
    ) -> ControlResult<Point> {
        let device = st
            .storage
            .get(&key(&storage.name, volume))
            .map(|v| v.device.clone())
            .ok_or_else(|| ControlError::bad_state(&storage.name, op, CLEAR))?;
        let image = std::fs::read(&device).map_err(|e| {
            ControlError::new(
                &storage.name,
                op,
                ControlFailure::Transport,
                format!("reading {}: {e}", device.display()),
            )
        })?;
        Ok(Point {
            gid: st.alloc_gid(volume),
            clean,
            image: Arc::new(image),
        })
    }

    fn storage_state(st: &SimState, node: &NodeName, volume: &str) -> &'static str {
        st.storage.get(&key(node, volume)).map_or(CLEAR, |v| v.state)
    }

    fn backup(
        &self,
        storage: &Node,
        volume: &str,
        op: &'static str,
        full: bool,
    ) -> ControlResult<Gid> {
        Self::expect_role(storage, NodeRole::Storage, op)?;
        let archive = self.topology.primary_archive().name.clone();
        self.call(storage, op, Some(volume), |st| {
            let state = Self::storage_state(st, &storage.name, volume);
            if state != SYNC_READY && state != MASTER {
                return Err(ControlError::bad_state(&storage.name, op, state));
            }
            if st.down.contains(&archive) {
                return Err(ControlError::new(
                    &storage.name,
                    op,
                    ControlFailure::Transport,
                    format!("{archive} is down"),
                ));
            }
            let target = st.archive(&archive, volume).cloned().unwrap_or_default();
            if target.sync_stopped {
                return Err(ControlError::rejected(
                    &storage.name,
                    op,
                    format!("{archive} stopped synchronizing {volume}"),
                ));
            }
            if target.state == STOPPED || (!full && target.state != ARCHIVED) {
                return Err(ControlError::bad_state(&archive, op, target.state));
            }

            let point = self.capture(st, storage, volume, true, op)?;
            let gid = point.gid;
            st.pending
                .retain(|p| !(p.archive == archive && p.volume == volume));
            let vol = st.archive_mut(&archive, volume);
            if full {
                vol.points.clear();
            }
            vol.insert(point);
            vol.state = ARCHIVED;
            vol.receiving = true;
            if let Some(s) = st.storage.get_mut(&key(&storage.name, volume)) {
                s.state = MASTER;
                s.resume = MASTER;
            }
            debug!(storage = %storage.name, %archive, volume, %gid, full, "backup complete");
            Ok(gid)
        })
    }
}

impl ClusterControl for SimCluster {
    async fn init(&self, storage: &Node, volume: &str, device: &Path) -> ControlResult<()> {
        Self::expect_role(storage, NodeRole::Storage, "init")?;
        self.call(storage, "init", Some(volume), |st| {
            let state = Self::storage_state(st, &storage.name, volume);
            if state != CLEAR {
                return Err(ControlError::bad_state(&storage.name, "init", state));
            }
            if !device.exists() {
                return Err(ControlError::rejected(
                    &storage.name,
                    "init",
                    format!("no device at {}", device.display()),
                ));
            }
            st.storage.insert(
                key(&storage.name, volume),
                StorageVol {
                    device: device.to_path_buf(),
                    state: SYNC_READY,
                    resume: SYNC_READY,
                },
            );
            Ok(())
        })
    }

    async fn full_backup(&self, storage: &Node, volume: &str) -> ControlResult<Gid> {
        self.backup(storage, volume, "full_backup", true)
    }

    async fn hash_backup(&self, storage: &Node, volume: &str) -> ControlResult<Gid> {
        self.backup(storage, volume, "hash_backup", false)
    }

    async fn snapshot_sync(
        &self,
        storage: &Node,
        volume: &str,
        archives: &[&Node],
    ) -> ControlResult<Gid> {
        Self::expect_role(storage, NodeRole::Storage, "snapshot_sync")?;
        self.call(storage, "snapshot_sync", Some(volume), |st| {
            let state = Self::storage_state(st, &storage.name, volume);
            if state != MASTER {
                return Err(ControlError::bad_state(&storage.name, "snapshot_sync", state));
            }
            for archive in archives {
                Self::expect_role(archive, NodeRole::Archive, "snapshot_sync")?;
                if let Some(reason) = self.blocked(st, &archive.name, volume) {
                    return Err(ControlError::new(
                        &storage.name,
                        "snapshot_sync",
                        ControlFailure::Timeout,
                        format!("snapshot never reached {}: {reason}", archive.name),
                    ));
                }
            }

            // Earlier snapshots arrive before this one.
            let targets: Vec<&NodeName> = archives.iter().map(|a| &a.name).collect();
            for p in &mut st.pending {
                if p.volume == volume && targets.contains(&&p.archive) {
                    p.wait = 0;
                }
            }
            self.pump(st);

            let point = self.capture(st, storage, volume, true, "snapshot_sync")?;
            let gid = point.gid;
            for archive in &targets {
                st.archive_mut(archive, volume).insert(point.clone());
            }
            self.ship(st, volume, &point, &targets);
            Ok(gid)
        })
    }

    async fn snapshot_async(&self, storage: &Node, volume: &str) -> ControlResult<Gid> {
        Self::expect_role(storage, NodeRole::Storage, "snapshot_async")?;
        self.call(storage, "snapshot_async", Some(volume), |st| {
            let state = Self::storage_state(st, &storage.name, volume);
            if state != MASTER {
                return Err(ControlError::bad_state(&storage.name, "snapshot_async", state));
            }
            let point = self.capture(st, storage, volume, true, "snapshot_async")?;
            let gid = point.gid;
            self.ship(st, volume, &point, &[]);
            Ok(gid)
        })
    }

    async fn apply_diff(&self, archive: &Node, volume: &str, gid: Gid) -> ControlResult<()> {
        Self::expect_role(archive, NodeRole::Archive, "apply_diff")?;
        self.call(archive, "apply_diff", Some(volume), |st| {
            let vol = st.archive_mut(&archive.name, volume);
            if vol.point(gid).is_none() {
                return Err(ControlError::rejected(
                    &archive.name,
                    "apply_diff",
                    format!("gid {gid} is not restorable"),
                ));
            }
            vol.points.retain(|p| p.gid >= gid);
            Ok(())
        })
    }

    async fn merge_diff(
        &self,
        archive: &Node,
        volume: &str,
        begin: Gid,
        end: Gid,
    ) -> ControlResult<()> {
        Self::expect_role(archive, NodeRole::Archive, "merge_diff")?;
        self.call(archive, "merge_diff", Some(volume), |st| {
            let vol = st.archive_mut(&archive.name, volume);
            if begin >= end || vol.point(begin).is_none() || vol.point(end).is_none() {
                return Err(ControlError::rejected(
                    &archive.name,
                    "merge_diff",
                    format!("bad range {begin}..{end}"),
                ));
            }
            vol.points.retain(|p| p.gid <= begin || p.gid >= end);
            Ok(())
        })
    }

    async fn replicate(
        &self,
        src: &Node,
        volume: &str,
        dst: &Node,
        synchronizing: bool,
    ) -> ControlResult<()> {
        Self::expect_role(src, NodeRole::Archive, "replicate")?;
        Self::expect_role(dst, NodeRole::Archive, "replicate")?;
        self.call(src, "replicate", Some(volume), |st| {
            if src.name == dst.name {
                return Err(ControlError::rejected(&src.name, "replicate", "source is destination"));
            }
            if st.down.contains(&dst.name) {
                return Err(ControlError::new(
                    &src.name,
                    "replicate",
                    ControlFailure::Transport,
                    format!("{} is down", dst.name),
                ));
            }
            let source = st.archive(&src.name, volume).cloned().unwrap_or_default();
            if source.state != ARCHIVED || source.points.is_empty() {
                return Err(ControlError::bad_state(&src.name, "replicate", source.state));
            }
            let dst_state = st.archive_state(&dst.name, volume);
            if dst_state == STOPPED {
                return Err(ControlError::bad_state(&dst.name, "replicate", dst_state));
            }
            st.pending
                .retain(|p| !(p.archive == dst.name && p.volume == volume));
            let target = st.archive_mut(&dst.name, volume);
            target.points = source.points;
            target.state = ARCHIVED;
            target.receiving = synchronizing;
            debug!(src = %src.name, dst = %dst.name, volume, synchronizing, "replicated");
            Ok(())
        })
    }

    async fn start_sync(&self, archive: &Node, volume: &str) -> ControlResult<()> {
        Self::expect_role(archive, NodeRole::Archive, "start_sync")?;
        self.call(archive, "start_sync", Some(volume), |st| {
            st.archive_mut(&archive.name, volume).sync_stopped = false;
            self.pump(st);
            Ok(())
        })
    }

    async fn stop_sync(&self, archive: &Node, volume: &str) -> ControlResult<()> {
        Self::expect_role(archive, NodeRole::Archive, "stop_sync")?;
        self.call(archive, "stop_sync", Some(volume), |st| {
            let vol = st.archive_mut(&archive.name, volume);
            if vol.state != ARCHIVED {
                return Err(ControlError::bad_state(&archive.name, "stop_sync", vol.state));
            }
            vol.sync_stopped = true;
            Ok(())
        })
    }

    async fn resize(&self, volume: &str, size_mb: u64, zero_clear: bool) -> ControlResult<()> {
        let storage = &self.topology.nodes(NodeRole::Storage)[0];
        self.call(storage, "resize", Some(volume), |st| {
            let devices: Vec<(NodeName, PathBuf)> = st
                .storage
                .iter()
                .filter(|((_, v), _)| v == volume)
                .map(|((n, _), s)| (n.clone(), s.device.clone()))
                .collect();
            if devices.is_empty() {
                return Err(ControlError::bad_state(&storage.name, "resize", CLEAR));
            }
            let Some(new_len) = size_mb.checked_mul(MIB) else {
                return Err(ControlError::rejected(
                    &storage.name,
                    "resize",
                    format!("{size_mb} MiB overflows a byte length"),
                ));
            };
            for (node, device) in devices {
                let io_err = |e: std::io::Error| {
                    ControlError::new(&node, "resize", ControlFailure::Transport, e.to_string())
                };
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&device)
                    .map_err(io_err)?;
                let len = file.metadata().map_err(io_err)?.len();
                if new_len < len {
                    return Err(ControlError::rejected(
                        &node,
                        "resize",
                        format!("cannot shrink {len} bytes to {size_mb} MiB"),
                    ));
                }
                // Extended space reads as zeros whether or not clearing was asked for.
                file.set_len(new_len).map_err(io_err)?;
                debug!(node = %node, volume, size_mb, zero_clear, "device resized");
            }
            Ok(())
        })
    }

    async fn stop(&self, node: &Node, volume: &str, mode: StopMode) -> ControlResult<()> {
        self.call(node, "stop", Some(volume), |st| {
            if mode == StopMode::Empty && node.role != NodeRole::Proxy {
                return Err(ControlError::rejected(&node.name, "stop", "empty mode is for proxies"));
            }
            match node.role {
                NodeRole::Storage => {
                    let state = Self::storage_state(st, &node.name, volume);
                    if state != MASTER && state != SYNC_READY {
                        return Err(ControlError::bad_state(&node.name, "stop", state));
                    }
                    if state == MASTER {
                        // Stopping cuts the current diff.
                        let point = self.capture(st, node, volume, false, "stop")?;
                        self.ship(st, volume, &point, &[]);
                    }
                    if let Some(s) = st.storage.get_mut(&key(&node.name, volume)) {
                        s.resume = s.state;
                        s.state = STOPPED;
                    }
                }
                NodeRole::Proxy => {
                    let k = key(&node.name, volume);
                    if st.proxy_stopped.contains(&k) {
                        return Err(ControlError::bad_state(&node.name, "stop", STOPPED));
                    }
                    if mode == StopMode::Empty {
                        for p in st.pending.iter_mut().filter(|p| p.volume == volume) {
                            p.wait = 0;
                        }
                        self.pump(st);
                    }
                    st.proxy_stopped.insert(k);
                }
                NodeRole::Archive => {
                    let vol = st.archive_mut(&node.name, volume);
                    if vol.state != ARCHIVED {
                        return Err(ControlError::bad_state(&node.name, "stop", vol.state));
                    }
                    vol.state = STOPPED;
                }
            }
            Ok(())
        })
    }

    async fn start(&self, node: &Node, volume: &str) -> ControlResult<()> {
        self.call(node, "start", Some(volume), |st| {
            match node.role {
                NodeRole::Storage => {
                    let Some(s) = st.storage.get_mut(&key(&node.name, volume)) else {
                        return Err(ControlError::bad_state(&node.name, "start", CLEAR));
                    };
                    if s.state != STOPPED {
                        return Err(ControlError::bad_state(&node.name, "start", s.state));
                    }
                    s.state = s.resume;
                }
                NodeRole::Proxy => {
                    if !st.proxy_stopped.remove(&key(&node.name, volume)) {
                        return Err(ControlError::bad_state(&node.name, "start", STARTED));
                    }
                }
                NodeRole::Archive => {
                    let vol = st.archive_mut(&node.name, volume);
                    if vol.state != STOPPED {
                        return Err(ControlError::bad_state(&node.name, "start", vol.state));
                    }
                    vol.state = ARCHIVED;
                }
            }
            self.pump(st);
            Ok(())
        })
    }

    async fn shutdown(&self, node: &Node, mode: ShutdownMode) -> ControlResult<()> {
        self.call(node, "shutdown", None, |st| {
            st.down.insert(node.name.clone());
            debug!(node = %node.name, %mode, "node shut down");
            Ok(())
        })
    }

    async fn startup(&self, node: &Node) -> ControlResult<()> {
        self.call(node, "startup", None, |st| {
            if !st.down.remove(&node.name) {
                return Err(ControlError::bad_state(&node.name, "startup", "running"));
            }
            self.pump(st);
            Ok(())
        })
    }

    async fn get_state(&self, node: &Node, volume: &str) -> ControlResult<String> {
        self.call(node, "get_state", Some(volume), |st| {
            let state = match node.role {
                NodeRole::Storage => Self::storage_state(st, &node.name, volume),
                NodeRole::Proxy if st.proxy_stopped.contains(&key(&node.name, volume)) => STOPPED,
                NodeRole::Proxy => STARTED,
                NodeRole::Archive => st.archive_state(&node.name, volume),
            };
            Ok(state.to_string())
        })
    }

    async fn list_restorable(
        &self,
        archive: &Node,
        volume: &str,
        filter: RestorableFilter,
    ) -> ControlResult<Vec<Gid>> {
        Self::expect_role(archive, NodeRole::Archive, "list_restorable")?;
        self.call(archive, "list_restorable", Some(volume), |st| {
            self.pump(st);
            let Some(vol) = st.archive(&archive.name, volume) else {
                return Ok(Vec::new());
            };
            Ok(vol
                .points
                .iter()
                .filter(|p| filter == RestorableFilter::All || p.clean)
                .map(|p| p.gid)
                .collect())
        })
    }

    async fn get_latest_clean_snapshot(&self, archive: &Node, volume: &str) -> ControlResult<Gid> {
        Self::expect_role(archive, NodeRole::Archive, "get_latest_clean_snapshot")?;
        self.call(archive, "get_latest_clean_snapshot", Some(volume), |st| {
            self.pump(st);
            st.archive(&archive.name, volume)
                .and_then(|v| v.points.iter().rev().find(|p| p.clean))
                .map(|p| p.gid)
                .ok_or_else(|| {
                    ControlError::rejected(
                        &archive.name,
                        "get_latest_clean_snapshot",
                        format!("no clean snapshot of {volume}"),
                    )
                })
        })
    }

    async fn remove_persistent_data(&self, node: &Node) -> ControlResult<()> {
        self.call(node, "remove_persistent_data", None, |st| {
            if !st.down.contains(&node.name) {
                return Err(ControlError::bad_state(
                    &node.name,
                    "remove_persistent_data",
                    "running",
                ));
            }
            let name = &node.name;
            st.storage.retain(|(n, _), _| n != name);
            st.proxy_stopped.retain(|(n, _)| n != name);
            st.archives.retain(|(n, _), _| n != name);
            st.pending.retain(|p| p.archive != *name);
            debug!(node = %name, "persistent data removed");
            Ok(())
        })
    }

    async fn restore(&self, archive: &Node, volume: &str, gid: Gid) -> ControlResult<PathBuf> {
        Self::expect_role(archive, NodeRole::Archive, "restore")?;
        self.call(archive, "restore", Some(volume), |st| {
            let image = st
                .archive(&archive.name, volume)
                .and_then(|v| v.point(gid))
                .map(|p| Arc::clone(&p.image))
                .ok_or_else(|| {
                    ControlError::rejected(&archive.name, "restore", format!("gid {gid} is not restorable"))
                })?;
            let path = self.restored_path(&archive.name, volume, gid);
            let io_err = |e: std::io::Error| {
                ControlError::new(&archive.name, "restore", ControlFailure::Transport, e.to_string())
            };
            std::fs::create_dir_all(&self.restore_dir).map_err(io_err)?;
            std::fs::write(&path, image.as_slice()).map_err(io_err)?;
            Ok(path)
        })
    }

    async fn delete_restored(&self, archive: &Node, volume: &str, gid: Gid) -> ControlResult<()> {
        Self::expect_role(archive, NodeRole::Archive, "delete_restored")?;
        self.call(archive, "delete_restored", Some(volume), |_| {
            let path = self.restored_path(&archive.name, volume, gid);
            std::fs::remove_file(&path).map_err(|e| {
                ControlError::rejected(&archive.name, "delete_restored", format!("{}: {e}", path.display()))
            })
        })
    }
}

impl SimCluster {
    fn restored_path(&self, archive: &NodeName, volume: &str, gid: Gid) -> PathBuf {
        self.restore_dir.join(format!("{archive}-{volume}-{gid}.img"))
    }
}

impl ClusterBootstrap for SimCluster {
    async fn reset(&self, _topology: &Topology, processes: &mut NodeProcesses) -> HarnessResult<()> {
        processes.release_all();
        // Recorded calls and scripted failures outlive the cluster state.
        let calls = {
            let mut st = self.lock();
            let calls = std::mem::take(&mut st.calls);
            let scripted = std::mem::take(&mut st.scripted);
            *st = SimState {
                calls,
                scripted,
                ..SimState::default()
            };
            st.calls.len()
        };
        if self.restore_dir.exists() {
            std::fs::remove_dir_all(&self.restore_dir).map_err(|source| HarnessError::WorkDir {
                path: self.restore_dir.clone(),
                action: "clear",
                source,
            })?;
        }
        debug!(recorded_calls = calls, "simulated cluster reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VirtualDevice;

    struct Fixture {
        _dir: tempfile::TempDir,
        sim: SimCluster,
        device: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("wdev0");
        std::fs::write(&device, vec![7u8; 8192]).unwrap();
        let topo = Topology::builder()
            .node(Node::storage("s0", "localhost", 10000))
            .node(Node::proxy("p0", "localhost", 10100))
            .node(Node::archive("a0", "localhost", 10200, "vg0"))
            .node(Node::archive("a1", "localhost", 10201, "vg1"))
            .device(VirtualDevice {
                id: "0".into(),
                path: device.clone(),
                data_extent: dir.path().join("data"),
                log_extent: dir.path().join("log"),
                size_mb: 1,
            })
            .volume("vol0", "0")
            .work_dir(dir.path().join("work"))
            .build()
            .unwrap();
        Fixture {
            sim: SimCluster::new(topo),
            device,
            _dir: dir,
        }
    }

    fn node<'a>(f: &'a Fixture, name: &str) -> &'a Node {
        f.sim.topology().node(name).unwrap()
    }

    async fn backed_up(f: &Fixture) -> Gid {
        f.sim.init(node(f, "s0"), "vol0", &f.device).await.unwrap();
        f.sim.full_backup(node(f, "s0"), "vol0").await.unwrap()
    }

    #[tokio::test]
    async fn test_backup_then_restore_matches_device() {
        let f = fixture();
        let gid = backed_up(&f).await;
        let a0 = node(&f, "a0");
        assert_eq!(f.sim.get_state(a0, "vol0").await.unwrap(), ARCHIVED);
        assert_eq!(f.sim.get_state(node(&f, "s0"), "vol0").await.unwrap(), MASTER);

        let path = f.sim.restore(a0, "vol0", gid).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&f.device).unwrap());
        f.sim.delete_restored(a0, "vol0", gid).await.unwrap();
        assert!(!path.exists());
        assert!(f.sim.delete_restored(a0, "vol0", gid).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_sync_blocked_by_stopped_proxy() {
        let f = fixture();
        backed_up(&f).await;
        let (s0, p0, a0) = (node(&f, "s0"), node(&f, "p0"), node(&f, "a0"));
        f.sim.stop(p0, "vol0", StopMode::Graceful).await.unwrap();
        let err = f.sim.snapshot_sync(s0, "vol0", &[a0]).await.unwrap_err();
        assert_eq!(err.failure, ControlFailure::Timeout);

        f.sim.start(p0, "vol0").await.unwrap();
        let gid = f.sim.snapshot_sync(s0, "vol0", &[a0]).await.unwrap();
        let list = f.sim.list_restorable(a0, "vol0", RestorableFilter::Clean).await.unwrap();
        assert_eq!(list.last(), Some(&gid));
    }

    #[tokio::test]
    async fn test_async_snapshot_respects_delivery_lag() {
        let mut f = fixture();
        f.sim = SimCluster::new(f.sim.topology().clone()).with_delivery_lag(2);
        backed_up(&f).await;
        let (s0, a0) = (node(&f, "s0"), node(&f, "a0"));
        let gid = f.sim.snapshot_async(s0, "vol0").await.unwrap();

        let seen = |list: Vec<Gid>| list.contains(&gid);
        assert!(!seen(f.sim.list_restorable(a0, "vol0", RestorableFilter::Clean).await.unwrap()));
        assert!(!seen(f.sim.list_restorable(a0, "vol0", RestorableFilter::Clean).await.unwrap()));
        assert!(seen(f.sim.list_restorable(a0, "vol0", RestorableFilter::Clean).await.unwrap()));
    }

    #[tokio::test]
    async fn test_storage_stop_cuts_unclean_point() {
        let f = fixture();
        let first = backed_up(&f).await;
        let (s0, a0) = (node(&f, "s0"), node(&f, "a0"));
        f.sim.stop(s0, "vol0", StopMode::Graceful).await.unwrap();
        f.sim.start(s0, "vol0").await.unwrap();
        let last = f.sim.snapshot_sync(s0, "vol0", &[a0]).await.unwrap();

        let all = f.sim.list_restorable(a0, "vol0", RestorableFilter::All).await.unwrap();
        let clean = f.sim.list_restorable(a0, "vol0", RestorableFilter::Clean).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(clean, [first, last]);

        f.sim.merge_diff(a0, "vol0", first, last).await.unwrap();
        assert_eq!(
            f.sim.list_restorable(a0, "vol0", RestorableFilter::All).await.unwrap(),
            [first, last]
        );
        f.sim.apply_diff(a0, "vol0", last).await.unwrap();
        assert_eq!(
            f.sim.list_restorable(a0, "vol0", RestorableFilter::All).await.unwrap(),
            [last]
        );
    }

    #[tokio::test]
    async fn test_cleared_archive_drops_snapshots_until_full_backup() {
        let f = fixture();
        backed_up(&f).await;
        let (s0, a0) = (node(&f, "s0"), node(&f, "a0"));

        assert!(f.sim.remove_persistent_data(a0).await.is_err());
        f.sim.shutdown(a0, ShutdownMode::Force).await.unwrap();
        f.sim.remove_persistent_data(a0).await.unwrap();
        f.sim.startup(a0).await.unwrap();
        assert_eq!(f.sim.get_state(a0, "vol0").await.unwrap(), CLEAR);

        let lost = f.sim.snapshot_async(s0, "vol0").await.unwrap();
        for _ in 0..3 {
            let list = f.sim.list_restorable(a0, "vol0", RestorableFilter::All).await.unwrap();
            assert!(!list.contains(&lost));
        }
        assert!(f.sim.hash_backup(s0, "vol0").await.is_err());

        let gid = f.sim.full_backup(s0, "vol0").await.unwrap();
        assert!(gid > lost);
        assert_eq!(
            f.sim.list_restorable(a0, "vol0", RestorableFilter::Clean).await.unwrap(),
            [gid]
        );
    }

    #[tokio::test]
    async fn test_backup_rejected_while_sync_stopped() {
        let f = fixture();
        backed_up(&f).await;
        let (s0, a0) = (node(&f, "s0"), node(&f, "a0"));
        f.sim.stop_sync(a0, "vol0").await.unwrap();
        let err = f.sim.full_backup(s0, "vol0").await.unwrap_err();
        assert_eq!(err.failure, ControlFailure::Rejected);
        f.sim.start_sync(a0, "vol0").await.unwrap();
        assert!(f.sim.hash_backup(s0, "vol0").await.is_ok());
    }

    #[tokio::test]
    async fn test_replication_modes() {
        let f = fixture();
        backed_up(&f).await;
        let (s0, a0, a1) = (node(&f, "s0"), node(&f, "a0"), node(&f, "a1"));

        f.sim.replicate(a0, "vol0", a1, false).await.unwrap();
        let gid = f.sim.snapshot_sync(s0, "vol0", &[a0]).await.unwrap();
        let on_a1 = f.sim.list_restorable(a1, "vol0", RestorableFilter::Clean).await.unwrap();
        assert!(!on_a1.contains(&gid));

        f.sim.replicate(a0, "vol0", a1, true).await.unwrap();
        let gid = f.sim.snapshot_sync(s0, "vol0", &[a0]).await.unwrap();
        let on_a1 = f.sim.list_restorable(a1, "vol0", RestorableFilter::Clean).await.unwrap();
        assert!(on_a1.contains(&gid));
    }

    #[tokio::test]
    async fn test_resize_grows_device_only() {
        let f = fixture();
        backed_up(&f).await;
        f.sim.resize("vol0", 2, true).await.unwrap();
        assert_eq!(std::fs::metadata(&f.device).unwrap().len(), 2 * MIB);
        let err = f.sim.resize("vol0", 1, false).await.unwrap_err();
        assert_eq!(err.failure, ControlFailure::Rejected);

        let err = f.sim.resize("vol0", u64::MAX, false).await.unwrap_err();
        assert_eq!(err.failure, ControlFailure::Rejected);
        assert!(err.message.contains("overflows"), "{err}");
        assert_eq!(std::fs::metadata(&f.device).unwrap().len(), 2 * MIB);
    }

    #[tokio::test]
    async fn test_injected_failure_and_call_log() {
        let f = fixture();
        let s0 = node(&f, "s0");
        f.sim.inject_failure("s0", "init", ControlFailure::Transport);
        let err = f.sim.init(s0, "vol0", &f.device).await.unwrap_err();
        assert_eq!(err.failure, ControlFailure::Transport);
        f.sim.init(s0, "vol0", &f.device).await.unwrap();

        let ops: Vec<_> = f.sim.calls().iter().map(|c| c.operation).collect();
        assert_eq!(ops, ["init", "init"]);
    }

    #[tokio::test]
    async fn test_wrong_role_rejected() {
        let f = fixture();
        let err = f
            .sim
            .full_backup(node(&f, "a0"), "vol0")
            .await
            .unwrap_err();
        assert_eq!(err.failure, ControlFailure::Rejected);
        assert!(err.message.contains("storage"));
    }

    #[tokio::test]
    async fn test_bootstrap_reset_clears_state() {
        let f = fixture();
        backed_up(&f).await;
        let mut procs = NodeProcesses::new();
        f.sim.reset(f.sim.topology(), &mut procs).await.unwrap();
        assert_eq!(f.sim.get_state(node(&f, "s0"), "vol0").await.unwrap(), CLEAR);
        assert_eq!(f.sim.get_state(node(&f, "a0"), "vol0").await.unwrap(), CLEAR);
    }
}

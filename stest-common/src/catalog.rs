//! Built-in scenarios.
//!
//! Each builder returns a [`ScenarioSpec`] over named nodes. The suite order
//! in [`default_suite`] matters: `full_backup` initializes the volume and every
//! later scenario builds on the state the earlier ones leave behind.

use crate::errors::{ConfigError, ErrorKind};
use crate::plan::{FaultPlan, stop_start_scenario};
use crate::scenario::{ScenarioSpec, Step};
use crate::topology::Topology;
use crate::types::{NodeRole, RestorableFilter, StopMode};
use crate::verify::Progress;

/// Polls made by `hide_and_recover` before the hidden archive may converge.
pub const HIDDEN_POLL_ATTEMPTS: u32 = 10;

/// init, write, full backup, restore, compare.
pub fn full_backup(storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    backup_and_compare(
        ScenarioSpec::new("full_backup", volume).init(storage),
        storage,
        archive,
    )
}

/// Full backup of a volume that is already initialized; re-seeds the archive.
pub fn full_backup_again(storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    backup_and_compare(ScenarioSpec::new("full_backup", volume), storage, archive)
}

fn backup_and_compare(spec: ScenarioSpec, storage: &str, archive: &str) -> ScenarioSpec {
    spec.write_once(1)
        .capture_digest("md0")
        .full_backup(storage, "gid")
        .capture_restorable_digest(archive, "gid", "md1")
        .verify_equal_digest("md0", "md1")
}

/// write, synchronized snapshot, restore, compare.
pub fn snapshot(storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("snapshot", volume)
        .write_once(1)
        .capture_digest("md0")
        .snapshot_sync(storage, &[archive], "gid")
        .wait_restorable(archive, "gid")
        .capture_restorable_digest(archive, "gid", "md1")
        .verify_equal_digest("md0", "md1")
}

/// write, hash backup, restore, compare.
pub fn hash_backup(storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("hash_backup", volume)
        .write_once(1)
        .capture_digest("md0")
        .hash_backup(storage, "gid")
        .capture_restorable_digest(archive, "gid", "md1")
        .verify_equal_digest("md0", "md1")
}

/// One stop/start ordering under writes; the planner supplies the ordering.
pub fn stop_start(plan: &FaultPlan, storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    stop_start_scenario(plan, volume, storage, archive)
}

/// Applying a diff must not change the image at its gid.
pub fn apply(storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("apply", volume)
        .start_writes()
        .settle_pause()
        .snapshot_sync(storage, &[archive], "gid")
        .settle_pause()
        .stop_writes()
        .capture_restorable_digest(archive, "gid", "md0")
        .apply_diff(archive, "gid")
        .capture_restorable_digest(archive, "gid", "md1")
        .verify_equal_digest("md0", "md1")
}

/// Merging two or more diffs must not change the image at the range end.
///
/// Stopping the storage node cuts an extra diff, and an emptying proxy stop
/// forces it to the archive, so the range holds at least two diffs.
pub fn merge(storage: &str, proxy: &str, archive: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("merge", volume)
        .start_writes()
        .settle_pause()
        .snapshot_sync(storage, &[archive], "begin")
        .settle_pause()
        .stop(storage, StopMode::Graceful)
        .stop(proxy, StopMode::Empty)
        .start(storage)
        .start(proxy)
        .settle_pause()
        .snapshot_sync(storage, &[archive], "end")
        .capture_restorable(archive, RestorableFilter::All, "points")
        .gid_span("points", "begin", "end", 2)
        .settle_pause()
        .stop_writes()
        .verify_gid_range("begin", "end")
        .capture_restorable_digest(archive, "end", "md0")
        .merge_diff(archive, "begin", "end")
        .capture_restorable_digest(archive, "end", "md1")
        .verify_equal_digest("md0", "md1")
}

/// One-shot replication leaves equal restorable sets and equal images at the
/// latest common gid.
pub fn replicate(src: &str, dst: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("replicate", volume)
        .replicate(src, dst, false)
        .verify_equal_restorable(src, dst, RestorableFilter::Clean)
        .capture_latest_clean(src, "latest")
        .capture_restorable_digest(src, "latest", "md0")
        .capture_restorable_digest(dst, "latest", "md1")
        .verify_equal_digest("md0", "md1")
}

/// An archive that lost its data must not receive snapshots until a full
/// backup re-seeds it.
pub fn hide_and_recover(storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("hide_and_recover", volume)
        .param("attempts", HIDDEN_POLL_ATTEMPTS)
        .hide(archive)
        .startup(archive)
        .write_once(1)
        .snapshot_async(storage, "lost")
        .verify_not_restorable(archive, "lost")
        .full_backup(storage, "seed")
        .wait_restorable(archive, "seed")
        .write_once(1)
        .snapshot_async(storage, "gid")
        .wait_restorable(archive, "gid")
        .verify_monotonic("gid", "lost", Progress::Expected)
}

/// Growing the volume keeps snapshots restorable to the device content.
pub fn resize(storage: &str, archive: &str, volume: &str, size_mb: u64) -> ScenarioSpec {
    ScenarioSpec::new("resize", volume)
        .param("size_mb", size_mb)
        .resize(size_mb, true)
        .write_once(1)
        .capture_digest("md0")
        .snapshot_sync(storage, &[archive], "gid")
        .capture_restorable_digest(archive, "gid", "md1")
        .verify_equal_digest("md0", "md1")
}

/// Gids advance across snapshots and stall while the proxy is stopped.
pub fn gid_monotonic(storage: &str, proxy: &str, archive: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("gid_monotonic", volume)
        .snapshot_sync(storage, &[archive], "g1")
        .write_once(1)
        .snapshot_sync(storage, &[archive], "g2")
        .verify_monotonic("g2", "g1", Progress::Expected)
        .stop(proxy, StopMode::Graceful)
        .snapshot_async(storage, "g3")
        .verify_not_restorable(archive, "g3")
        .capture_latest_clean(archive, "stalled")
        .verify_monotonic("stalled", "g2", Progress::Blocked)
        .start(proxy)
        .wait_restorable(archive, "g3")
        .capture_latest_clean(archive, "resumed")
        .verify_monotonic("resumed", "g2", Progress::Expected)
}

/// Stop one node, let the cluster settle, start it again.
pub fn stop_start_node(node: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("stop_start_node", volume)
        .param("node", node)
        .stop(node, StopMode::Graceful)
        .settle_pause()
        .start(node)
}

/// Negative: a full backup must be rejected while the archive has stopped
/// synchronizing.
pub fn backup_while_sync_stopped(storage: &str, archive: &str, volume: &str) -> ScenarioSpec {
    ScenarioSpec::new("backup_while_sync_stopped", volume)
        .stop_sync(archive)
        .expect(
            Step::FullBackup {
                storage: storage.into(),
                bind: "rejected".into(),
            },
            ErrorKind::Control,
        )
        .start_sync(archive)
}

/// Scenarios the randomized soak draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoakAction {
    FullBackup,
    Snapshot,
    HashBackup,
    Merge,
    Apply,
    /// Stop and start one node picked by the same generator.
    StopStart,
}

impl SoakAction {
    pub const ALL: [Self; 6] = [
        Self::FullBackup,
        Self::Snapshot,
        Self::HashBackup,
        Self::Merge,
        Self::Apply,
        Self::StopStart,
    ];
}

/// An initializing full backup followed by `count` scenarios drawn from
/// [`SoakAction::ALL`]. The draw depends only on `seed`, so a failing soak
/// replays exactly.
pub fn random_actions(
    topology: &Topology,
    volume: &str,
    count: u32,
    seed: u64,
) -> Result<Vec<ScenarioSpec>, ConfigError> {
    topology.device_for(volume)?;
    let storage = topology.nodes(NodeRole::Storage)[0].name.as_str();
    let proxy = topology.nodes(NodeRole::Proxy)[0].name.as_str();
    let archive = topology.primary_archive().name.as_str();
    let faultable = [storage, proxy, archive];

    let mut rng = fastrand::Rng::with_seed(seed);
    let mut specs = Vec::with_capacity(count as usize + 1);
    specs.push(full_backup(storage, archive, volume));
    for iteration in 0..count {
        let spec = match SoakAction::ALL[rng.usize(..SoakAction::ALL.len())] {
            SoakAction::FullBackup => full_backup_again(storage, archive, volume),
            SoakAction::Snapshot => snapshot(storage, archive, volume),
            SoakAction::HashBackup => hash_backup(storage, archive, volume),
            SoakAction::Merge => merge(storage, proxy, archive, volume),
            SoakAction::Apply => apply(storage, archive, volume),
            SoakAction::StopStart => {
                stop_start_node(faultable[rng.usize(..faultable.len())], volume)
            }
        };
        specs.push(spec.param("iteration", iteration).param("seed", seed));
    }
    Ok(specs)
}

/// A suite entry from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEntry {
    Scenario(ScenarioSpec),
    Negative(ScenarioSpec),
}

/// The standard scenario order over the first node of each role. Replication
/// runs only when the topology has a second archive.
pub fn default_suite(topology: &Topology, volume: &str) -> Result<Vec<CatalogEntry>, ConfigError> {
    let device = topology.device_for(volume)?;
    let storage = topology.nodes(NodeRole::Storage)[0].name.as_str();
    let proxy = topology.nodes(NodeRole::Proxy)[0].name.as_str();
    let archives = topology.nodes(NodeRole::Archive);
    let archive = topology.primary_archive().name.as_str();

    let mut suite = vec![
        CatalogEntry::Scenario(full_backup(storage, archive, volume)),
        CatalogEntry::Scenario(snapshot(storage, archive, volume)),
        CatalogEntry::Scenario(hash_backup(storage, archive, volume)),
        CatalogEntry::Scenario(apply(storage, archive, volume)),
        CatalogEntry::Scenario(merge(storage, proxy, archive, volume)),
    ];
    if let Some(second) = archives.get(1) {
        suite.push(CatalogEntry::Scenario(replicate(
            archive,
            second.name.as_str(),
            volume,
        )));
    }
    suite.extend([
        CatalogEntry::Scenario(gid_monotonic(storage, proxy, archive, volume)),
        CatalogEntry::Scenario(resize(
            storage,
            archive,
            volume,
            device.size_mb.saturating_mul(2),
        )),
        CatalogEntry::Scenario(hide_and_recover(storage, archive, volume)),
        CatalogEntry::Negative(backup_while_sync_stopped(storage, archive, volume)),
    ]);
    Ok(suite)
}

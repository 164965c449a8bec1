//! Scenario model and executor.
//!
//! A [`ScenarioSpec`] is plain data: a volume, some descriptive parameters and
//! an ordered list of [`Step`]s. [`ScenarioExecutor::run`] validates the whole
//! spec against the topology before the first side effect, executes the
//! steps strictly in order, always stops the background workload, and turns
//! the outcome into a [`ScenarioReport`].

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::config::{HarnessConfig, TimingConfig, WorkloadConfig};
use crate::control::ClusterControl;
use crate::device::{Blake3Digest, ContentDigest, FileRandomWriter, RandomWriter};
use crate::errors::{ConfigError, ErrorKind, HarnessError, HarnessResult};
use crate::topology::Topology;
use crate::types::{Digest, Gid, Node, NodeName, NodeRole, RestorableFilter, ShutdownMode, StopMode};
use crate::verify::{Progress, Verifier, VerifyConfig, verify_gid_range, verify_monotonic_gid};
use crate::writer::{BackgroundWriter, WriteStats};

/// A gid argument: either a value captured earlier under a name, or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GidRef {
    Bound(String),
    Literal(Gid),
}

impl From<&str> for GidRef {
    fn from(name: &str) -> Self {
        Self::Bound(name.to_string())
    }
}

impl From<Gid> for GidRef {
    fn from(gid: Gid) -> Self {
        Self::Literal(gid)
    }
}

impl std::fmt::Display for GidRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bound(name) => write!(f, "${name}"),
            Self::Literal(gid) => write!(f, "{gid}"),
        }
    }
}

/// One scenario step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    // Control
    Init { storage: NodeName },
    FullBackup { storage: NodeName, bind: String },
    HashBackup { storage: NodeName, bind: String },
    SnapshotSync { storage: NodeName, archives: Vec<NodeName>, bind: String },
    SnapshotAsync { storage: NodeName, bind: String },
    ApplyDiff { archive: NodeName, gid: GidRef },
    MergeDiff { archive: NodeName, begin: GidRef, end: GidRef },
    Replicate { src: NodeName, dst: NodeName, synchronizing: bool },
    StartSync { archive: NodeName },
    StopSync { archive: NodeName },
    Resize { size_mb: u64, zero_clear: bool },
    Stop { node: NodeName, mode: StopMode },
    Start { node: NodeName },
    Shutdown { node: NodeName, mode: ShutdownMode },
    Startup { node: NodeName },
    RemovePersistentData { node: NodeName },
    /// Force shutdown, then wipe the node's persistent data.
    Hide { node: NodeName },
    /// Materialize the image at `gid` and bind its digest. The image is kept
    /// until a matching `DeleteRestored`.
    Restore { archive: NodeName, gid: GidRef, bind: String },
    DeleteRestored { archive: NodeName, gid: GidRef },

    // Workload
    StartWrites,
    StopWrites,
    WriteOnce { bursts: u32 },

    // Timing
    Pause(Duration),
    StepPause,
    SettlePause,

    // Captures
    CaptureDigest { bind: String },
    /// Restore, digest and delete the image at `gid`.
    CaptureRestorableDigest { archive: NodeName, gid: GidRef, bind: String },
    CaptureRestorable { archive: NodeName, filter: RestorableFilter, bind: String },
    CaptureLatestClean { archive: NodeName, bind: String },

    // Checks
    VerifyEqualDigest { a: String, b: String },
    VerifyEqualRestorable { a: NodeName, b: NodeName, filter: RestorableFilter },
    WaitRestorable { archive: NodeName, gid: GidRef },
    VerifyNotRestorable { archive: NodeName, gid: GidRef },
    VerifyMonotonic { observed: GidRef, previous: GidRef, progress: Progress },
    WaitForState { node: NodeName, states: Vec<String> },
    VerifyState { node: NodeName, state: String },
    VerifyGidRange { begin: GidRef, end: GidRef },
    /// `end` must sit at least `min` positions after `begin` in a captured list.
    GidSpan { list: String, begin: GidRef, end: GidRef, min: usize },

    /// The wrapped step must fail with `kind`.
    Expect { op: Box<Step>, kind: ErrorKind },
}

impl Step {
    /// Short operation name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::FullBackup { .. } => "full_backup",
            Self::HashBackup { .. } => "hash_backup",
            Self::SnapshotSync { .. } => "snapshot_sync",
            Self::SnapshotAsync { .. } => "snapshot_async",
            Self::ApplyDiff { .. } => "apply_diff",
            Self::MergeDiff { .. } => "merge_diff",
            Self::Replicate { .. } => "replicate",
            Self::StartSync { .. } => "start_sync",
            Self::StopSync { .. } => "stop_sync",
            Self::Resize { .. } => "resize",
            Self::Stop { .. } => "stop",
            Self::Start { .. } => "start",
            Self::Shutdown { .. } => "shutdown",
            Self::Startup { .. } => "startup",
            Self::RemovePersistentData { .. } => "remove_persistent_data",
            Self::Hide { .. } => "hide",
            Self::Restore { .. } => "restore",
            Self::DeleteRestored { .. } => "delete_restored",
            Self::StartWrites => "start_writes",
            Self::StopWrites => "stop_writes",
            Self::WriteOnce { .. } => "write_once",
            Self::Pause(_) => "pause",
            Self::StepPause => "step_pause",
            Self::SettlePause => "settle_pause",
            Self::CaptureDigest { .. } => "capture_digest",
            Self::CaptureRestorableDigest { .. } => "capture_restorable_digest",
            Self::CaptureRestorable { .. } => "capture_restorable",
            Self::CaptureLatestClean { .. } => "capture_latest_clean",
            Self::VerifyEqualDigest { .. } => "verify_equal_digest",
            Self::VerifyEqualRestorable { .. } => "verify_equal_restorable",
            Self::WaitRestorable { .. } => "wait_restorable",
            Self::VerifyNotRestorable { .. } => "verify_not_restorable",
            Self::VerifyMonotonic { .. } => "verify_monotonic",
            Self::WaitForState { .. } => "wait_for_state",
            Self::VerifyState { .. } => "verify_state",
            Self::VerifyGidRange { .. } => "verify_gid_range",
            Self::GidSpan { .. } => "gid_span",
            Self::Expect { .. } => "expect",
        }
    }
}

/// A named, self-describing scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSpec {
    pub name: String,
    pub volume: String,
    /// Free-form parameters copied into the report (e.g. fault orderings).
    pub params: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

fn names(nodes: &[&str]) -> Vec<NodeName> {
    nodes.iter().map(|n| NodeName::from(*n)).collect()
}

impl ScenarioSpec {
    pub fn new(name: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volume: volume.into(),
            params: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Whether any step is an expected failure.
    pub fn has_expectations(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Expect { .. }))
    }

    pub fn init(self, storage: &str) -> Self {
        self.step(Step::Init {
            storage: storage.into(),
        })
    }

    pub fn full_backup(self, storage: &str, bind: &str) -> Self {
        self.step(Step::FullBackup {
            storage: storage.into(),
            bind: bind.into(),
        })
    }

    pub fn hash_backup(self, storage: &str, bind: &str) -> Self {
        self.step(Step::HashBackup {
            storage: storage.into(),
            bind: bind.into(),
        })
    }

    pub fn snapshot_sync(self, storage: &str, archives: &[&str], bind: &str) -> Self {
        self.step(Step::SnapshotSync {
            storage: storage.into(),
            archives: names(archives),
            bind: bind.into(),
        })
    }

    pub fn snapshot_async(self, storage: &str, bind: &str) -> Self {
        self.step(Step::SnapshotAsync {
            storage: storage.into(),
            bind: bind.into(),
        })
    }

    pub fn apply_diff(self, archive: &str, gid: impl Into<GidRef>) -> Self {
        self.step(Step::ApplyDiff {
            archive: archive.into(),
            gid: gid.into(),
        })
    }

    pub fn merge_diff(self, archive: &str, begin: impl Into<GidRef>, end: impl Into<GidRef>) -> Self {
        self.step(Step::MergeDiff {
            archive: archive.into(),
            begin: begin.into(),
            end: end.into(),
        })
    }

    pub fn replicate(self, src: &str, dst: &str, synchronizing: bool) -> Self {
        self.step(Step::Replicate {
            src: src.into(),
            dst: dst.into(),
            synchronizing,
        })
    }

    pub fn start_sync(self, archive: &str) -> Self {
        self.step(Step::StartSync {
            archive: archive.into(),
        })
    }

    pub fn stop_sync(self, archive: &str) -> Self {
        self.step(Step::StopSync {
            archive: archive.into(),
        })
    }

    pub fn resize(self, size_mb: u64, zero_clear: bool) -> Self {
        self.step(Step::Resize { size_mb, zero_clear })
    }

    pub fn stop(self, node: &str, mode: StopMode) -> Self {
        self.step(Step::Stop {
            node: node.into(),
            mode,
        })
    }

    pub fn start(self, node: &str) -> Self {
        self.step(Step::Start { node: node.into() })
    }

    pub fn shutdown(self, node: &str, mode: ShutdownMode) -> Self {
        self.step(Step::Shutdown {
            node: node.into(),
            mode,
        })
    }

    pub fn startup(self, node: &str) -> Self {
        self.step(Step::Startup { node: node.into() })
    }

    pub fn remove_persistent_data(self, node: &str) -> Self {
        self.step(Step::RemovePersistentData { node: node.into() })
    }

    pub fn hide(self, node: &str) -> Self {
        self.step(Step::Hide { node: node.into() })
    }

    pub fn restore(self, archive: &str, gid: impl Into<GidRef>, bind: &str) -> Self {
        self.step(Step::Restore {
            archive: archive.into(),
            gid: gid.into(),
            bind: bind.into(),
        })
    }

    pub fn delete_restored(self, archive: &str, gid: impl Into<GidRef>) -> Self {
        self.step(Step::DeleteRestored {
            archive: archive.into(),
            gid: gid.into(),
        })
    }

    pub fn start_writes(self) -> Self {
        self.step(Step::StartWrites)
    }

    pub fn stop_writes(self) -> Self {
        self.step(Step::StopWrites)
    }

    pub fn write_once(self, bursts: u32) -> Self {
        self.step(Step::WriteOnce { bursts })
    }

    pub fn pause(self, duration: Duration) -> Self {
        self.step(Step::Pause(duration))
    }

    pub fn step_pause(self) -> Self {
        self.step(Step::StepPause)
    }

    pub fn settle_pause(self) -> Self {
        self.step(Step::SettlePause)
    }

    pub fn capture_digest(self, bind: &str) -> Self {
        self.step(Step::CaptureDigest { bind: bind.into() })
    }

    pub fn capture_restorable_digest(self, archive: &str, gid: impl Into<GidRef>, bind: &str) -> Self {
        self.step(Step::CaptureRestorableDigest {
            archive: archive.into(),
            gid: gid.into(),
            bind: bind.into(),
        })
    }

    pub fn capture_restorable(self, archive: &str, filter: RestorableFilter, bind: &str) -> Self {
        self.step(Step::CaptureRestorable {
            archive: archive.into(),
            filter,
            bind: bind.into(),
        })
    }

    pub fn capture_latest_clean(self, archive: &str, bind: &str) -> Self {
        self.step(Step::CaptureLatestClean {
            archive: archive.into(),
            bind: bind.into(),
        })
    }

    pub fn verify_equal_digest(self, a: &str, b: &str) -> Self {
        self.step(Step::VerifyEqualDigest {
            a: a.into(),
            b: b.into(),
        })
    }

    pub fn verify_equal_restorable(self, a: &str, b: &str, filter: RestorableFilter) -> Self {
        self.step(Step::VerifyEqualRestorable {
            a: a.into(),
            b: b.into(),
            filter,
        })
    }

    pub fn wait_restorable(self, archive: &str, gid: impl Into<GidRef>) -> Self {
        self.step(Step::WaitRestorable {
            archive: archive.into(),
            gid: gid.into(),
        })
    }

    pub fn verify_not_restorable(self, archive: &str, gid: impl Into<GidRef>) -> Self {
        self.step(Step::VerifyNotRestorable {
            archive: archive.into(),
            gid: gid.into(),
        })
    }

    pub fn verify_monotonic(
        self,
        observed: impl Into<GidRef>,
        previous: impl Into<GidRef>,
        progress: Progress,
    ) -> Self {
        self.step(Step::VerifyMonotonic {
            observed: observed.into(),
            previous: previous.into(),
            progress,
        })
    }

    pub fn wait_for_state(self, node: &str, states: &[&str]) -> Self {
        self.step(Step::WaitForState {
            node: node.into(),
            states: states.iter().map(ToString::to_string).collect(),
        })
    }

    pub fn verify_state(self, node: &str, state: &str) -> Self {
        self.step(Step::VerifyState {
            node: node.into(),
            state: state.into(),
        })
    }

    pub fn verify_gid_range(self, begin: impl Into<GidRef>, end: impl Into<GidRef>) -> Self {
        self.step(Step::VerifyGidRange {
            begin: begin.into(),
            end: end.into(),
        })
    }

    pub fn gid_span(
        self,
        list: &str,
        begin: impl Into<GidRef>,
        end: impl Into<GidRef>,
        min: usize,
    ) -> Self {
        self.step(Step::GidSpan {
            list: list.into(),
            begin: begin.into(),
            end: end.into(),
            min,
        })
    }

    pub fn expect(self, op: Step, kind: ErrorKind) -> Self {
        self.step(Step::Expect {
            op: Box::new(op),
            kind,
        })
    }
}

/// How an expected-failure step actually ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "kind", rename_all = "snake_case")]
pub enum NegativeOutcome {
    /// Failed with the expected kind.
    ExpectedFailure(ErrorKind),
    /// Did not fail at all.
    UnexpectedSuccess,
    /// Failed, but with another kind.
    UnexpectedFailure(ErrorKind),
}

impl NegativeOutcome {
    pub fn classify<T>(expected: ErrorKind, result: &HarnessResult<T>) -> Self {
        match result {
            Ok(_) => Self::UnexpectedSuccess,
            Err(e) if e.kind() == expected => Self::ExpectedFailure(expected),
            Err(e) => Self::UnexpectedFailure(e.kind()),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::ExpectedFailure(_))
    }
}

/// Record of one `Expect` step.
#[derive(Debug, Clone, Serialize)]
pub struct NegativeRecord {
    pub step: usize,
    pub operation: &'static str,
    pub expected: ErrorKind,
    pub outcome: NegativeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn digests_as_hex<S: Serializer>(
    digests: &BTreeMap<String, Digest>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(digests.iter().map(|(k, v)| (k, v.to_hex())))
}

/// Values captured by a scenario, by name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Bindings {
    pub gids: BTreeMap<String, Gid>,
    #[serde(serialize_with = "digests_as_hex")]
    pub digests: BTreeMap<String, Digest>,
    pub lists: BTreeMap<String, Vec<Gid>>,
}

impl Bindings {
    pub fn gid(&self, name: &str) -> Option<Gid> {
        self.gids.get(name).copied()
    }

    pub fn digest(&self, name: &str) -> Option<&Digest> {
        self.digests.get(name)
    }

    pub fn list(&self, name: &str) -> Option<&[Gid]> {
        self.lists.get(name).map(Vec::as_slice)
    }
}

/// Final status of a scenario.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed,
    Failed {
        kind: ErrorKind,
        code: &'static str,
        /// Index of the failing step; absent for validation failures.
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<&'static str>,
        message: String,
    },
}

/// Report of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub volume: String,
    pub params: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps_total: usize,
    pub steps_run: usize,
    pub outcome: ScenarioOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub negatives: Vec<NegativeRecord>,
    pub bindings: Bindings,
    pub writes: WriteStats,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, ScenarioOutcome::Passed)
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ScenarioOutcome::Passed => None,
            ScenarioOutcome::Failed { kind, .. } => Some(*kind),
        }
    }

    /// Report for a scenario rejected before any step ran.
    pub(crate) fn rejected(spec: &ScenarioSpec, error: &HarnessError) -> Self {
        Self {
            scenario: spec.name.clone(),
            volume: spec.volume.clone(),
            params: spec.params.clone(),
            started_at: Utc::now(),
            duration_ms: 0,
            steps_total: spec.steps.len(),
            steps_run: 0,
            outcome: ScenarioOutcome::Failed {
                kind: error.kind(),
                code: error.kind().code(),
                step: None,
                operation: None,
                message: error.to_string(),
            },
            negatives: Vec::new(),
            bindings: Bindings::default(),
            writes: WriteStats::default(),
        }
    }
}

struct StepFailure {
    step: Option<usize>,
    operation: Option<&'static str>,
    error: HarnessError,
}

impl From<ConfigError> for StepFailure {
    fn from(e: ConfigError) -> Self {
        Self {
            step: None,
            operation: None,
            error: e.into(),
        }
    }
}

#[derive(Default)]
struct RunState {
    bindings: Bindings,
    writer: Option<BackgroundWriter>,
    writes: WriteStats,
    negatives: Vec<NegativeRecord>,
    steps_run: usize,
}

impl RunState {
    fn gid(&self, gid: &GidRef) -> HarnessResult<Gid> {
        match gid {
            GidRef::Literal(g) => Ok(*g),
            GidRef::Bound(name) => self.bindings.gid(name).ok_or_else(|| unbound("gid", name)),
        }
    }

    fn digest(&self, name: &str) -> HarnessResult<&Digest> {
        self.bindings
            .digest(name)
            .ok_or_else(|| unbound("digest", name))
    }

    fn list(&self, name: &str) -> HarnessResult<&[Gid]> {
        self.bindings.list(name).ok_or_else(|| unbound("list", name))
    }

    fn add_writes(&mut self, stats: WriteStats) {
        self.writes.bursts += stats.bursts;
        self.writes.bytes += stats.bytes;
    }
}

fn unbound(what: &str, name: &str) -> HarnessError {
    ConfigError::InvalidScenario {
        scenario: String::new(),
        reason: format!("{what} {name} is not bound"),
    }
    .into()
}

/// Names bound so far during validation.
#[derive(Default)]
struct Scope<'s> {
    gids: HashSet<&'s str>,
    digests: HashSet<&'s str>,
    lists: HashSet<&'s str>,
    writing: bool,
}

/// Runs scenarios against one cluster.
pub struct ScenarioExecutor<'a, C> {
    control: &'a C,
    topology: &'a Topology,
    timing: TimingConfig,
    workload: WorkloadConfig,
    digest: Arc<dyn ContentDigest>,
    writer: Arc<dyn RandomWriter>,
}

impl<'a, C: ClusterControl> ScenarioExecutor<'a, C> {
    /// Executor with the blake3 digest and file random writer.
    pub fn new(control: &'a C, topology: &'a Topology, config: &HarnessConfig) -> Self {
        Self {
            control,
            topology,
            timing: config.timing.clone(),
            workload: config.workload.clone(),
            digest: Arc::new(Blake3Digest),
            writer: Arc::new(FileRandomWriter),
        }
    }

    pub fn with_digest(mut self, digest: Arc<dyn ContentDigest>) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn RandomWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    pub fn topology(&self) -> &Topology {
        self.topology
    }

    /// Run `spec` to completion. Never panics on scenario failure; the
    /// failure is in the report.
    pub async fn run(&self, spec: &ScenarioSpec) -> ScenarioReport {
        let started_at = Utc::now();
        let start = Instant::now();
        info!(scenario = %spec.name, volume = %spec.volume, steps = spec.steps.len(), "scenario started");

        let mut state = RunState::default();
        let mut result = match self.validate(spec) {
            Ok(()) => self.execute(spec, &mut state).await,
            Err(e) => Err(e.into()),
        };

        // Every exit path stops the workload before reporting.
        if let Some(mut writer) = state.writer.take() {
            match writer.stop().await {
                Ok(stats) => state.add_writes(stats),
                Err(error) if result.is_ok() => {
                    result = Err(StepFailure {
                        step: None,
                        operation: Some("stop_writes"),
                        error,
                    });
                }
                Err(error) => warn!(scenario = %spec.name, %error, "workload also failed"),
            }
        }

        let duration = start.elapsed();
        let outcome = match result {
            Ok(()) => {
                info!(scenario = %spec.name, elapsed = ?duration, "scenario passed");
                ScenarioOutcome::Passed
            }
            Err(f) => {
                let kind = f.error.kind();
                warn!(
                    scenario = %spec.name,
                    step = ?f.step,
                    operation = ?f.operation,
                    code = kind.code(),
                    error = %f.error,
                    "scenario failed"
                );
                ScenarioOutcome::Failed {
                    kind,
                    code: kind.code(),
                    step: f.step,
                    operation: f.operation,
                    message: f.error.to_string(),
                }
            }
        };

        ScenarioReport {
            scenario: spec.name.clone(),
            volume: spec.volume.clone(),
            params: spec.params.clone(),
            started_at,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            steps_total: spec.steps.len(),
            steps_run: state.steps_run,
            outcome,
            negatives: state.negatives,
            bindings: state.bindings,
            writes: state.writes,
        }
    }

    /// Check every node, role and binding reference without touching the
    /// cluster.
    pub fn validate(&self, spec: &ScenarioSpec) -> Result<(), ConfigError> {
        self.topology.device_for(&spec.volume)?;
        let mut scope = Scope::default();
        for step in &spec.steps {
            self.validate_step(spec, step, &mut scope, false)?;
        }
        Ok(())
    }

    fn validate_step<'s>(
        &self,
        spec: &ScenarioSpec,
        step: &'s Step,
        scope: &mut Scope<'s>,
        nested: bool,
    ) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidScenario {
            scenario: spec.name.clone(),
            reason,
        };
        let role = |name: &NodeName, role: NodeRole| {
            self.topology
                .node_with_role(name.as_str(), role)
                .map(|_| ())
        };
        let any = |name: &NodeName| self.topology.node(name.as_str()).map(|_| ());
        let gid = |scope: &Scope<'_>, r: &GidRef| match r {
            GidRef::Bound(name) if !scope.gids.contains(name.as_str()) => {
                Err(invalid(format!("{} uses unbound gid {name}", step.name())))
            }
            _ => Ok(()),
        };

        // Bindings made inside an expected failure never become visible.
        let bind_gid = |scope: &mut Scope<'s>, name: &'s str| {
            if !nested {
                scope.gids.insert(name);
            }
        };

        match step {
            Step::Init { storage } => role(storage, NodeRole::Storage)?,
            Step::FullBackup { storage, bind }
            | Step::HashBackup { storage, bind }
            | Step::SnapshotAsync { storage, bind } => {
                role(storage, NodeRole::Storage)?;
                bind_gid(scope, bind);
            }
            Step::SnapshotSync {
                storage,
                archives,
                bind,
            } => {
                role(storage, NodeRole::Storage)?;
                if archives.is_empty() {
                    return Err(invalid("snapshot_sync needs at least one archive".into()));
                }
                for a in archives {
                    role(a, NodeRole::Archive)?;
                }
                bind_gid(scope, bind);
            }
            Step::ApplyDiff { archive, gid: g } => {
                role(archive, NodeRole::Archive)?;
                gid(scope, g)?;
            }
            Step::MergeDiff {
                archive,
                begin,
                end,
            } => {
                role(archive, NodeRole::Archive)?;
                gid(scope, begin)?;
                gid(scope, end)?;
            }
            Step::Replicate { src, dst, .. } => {
                role(src, NodeRole::Archive)?;
                role(dst, NodeRole::Archive)?;
                if src == dst {
                    return Err(invalid(format!("replicate from {src} to itself")));
                }
            }
            Step::StartSync { archive } | Step::StopSync { archive } => {
                role(archive, NodeRole::Archive)?;
            }
            Step::Resize { size_mb, .. } => {
                if *size_mb == 0 {
                    return Err(invalid("resize to 0 MiB".into()));
                }
            }
            Step::Stop { node, mode } => {
                if *mode == StopMode::Empty {
                    role(node, NodeRole::Proxy)?;
                } else {
                    any(node)?;
                }
            }
            Step::Start { node }
            | Step::Shutdown { node, .. }
            | Step::Startup { node }
            | Step::RemovePersistentData { node }
            | Step::Hide { node }
            | Step::WaitForState { node, .. }
            | Step::VerifyState { node, .. } => {
                any(node)?;
                if let Step::WaitForState { states, .. } = step
                    && states.is_empty()
                {
                    return Err(invalid("wait_for_state needs at least one state".into()));
                }
            }
            Step::Restore {
                archive,
                gid: g,
                bind,
            }
            | Step::CaptureRestorableDigest {
                archive,
                gid: g,
                bind,
            } => {
                role(archive, NodeRole::Archive)?;
                gid(scope, g)?;
                if !nested {
                    scope.digests.insert(bind);
                }
            }
            Step::DeleteRestored { archive, gid: g }
            | Step::WaitRestorable { archive, gid: g }
            | Step::VerifyNotRestorable { archive, gid: g } => {
                role(archive, NodeRole::Archive)?;
                gid(scope, g)?;
            }
            Step::StartWrites => {
                if scope.writing {
                    return Err(invalid("writes already running".into()));
                }
                scope.writing = true;
            }
            Step::StopWrites => {
                if !scope.writing {
                    return Err(invalid("stop_writes without running writes".into()));
                }
                scope.writing = false;
            }
            Step::WriteOnce { bursts } => {
                if scope.writing {
                    return Err(invalid("write_once while writes run".into()));
                }
                if *bursts == 0 {
                    return Err(invalid("write_once of zero bursts".into()));
                }
            }
            Step::Pause(_) | Step::StepPause | Step::SettlePause => {}
            Step::CaptureDigest { bind } => {
                if scope.writing {
                    return Err(invalid(format!("device digest {bind} taken while writes run")));
                }
                if !nested {
                    scope.digests.insert(bind);
                }
            }
            Step::CaptureRestorable { archive, bind, .. } => {
                role(archive, NodeRole::Archive)?;
                if !nested {
                    scope.lists.insert(bind);
                }
            }
            Step::CaptureLatestClean { archive, bind } => {
                role(archive, NodeRole::Archive)?;
                bind_gid(scope, bind);
            }
            Step::VerifyEqualDigest { a, b } => {
                for name in [a, b] {
                    if !scope.digests.contains(name.as_str()) {
                        return Err(invalid(format!("digest {name} is not bound")));
                    }
                }
            }
            Step::VerifyEqualRestorable { a, b, .. } => {
                role(a, NodeRole::Archive)?;
                role(b, NodeRole::Archive)?;
            }
            Step::VerifyMonotonic {
                observed, previous, ..
            } => {
                gid(scope, observed)?;
                gid(scope, previous)?;
            }
            Step::VerifyGidRange { begin, end } => {
                gid(scope, begin)?;
                gid(scope, end)?;
            }
            Step::GidSpan {
                list,
                begin,
                end,
                min,
            } => {
                if !scope.lists.contains(list.as_str()) {
                    return Err(invalid(format!("list {list} is not bound")));
                }
                if *min == 0 {
                    return Err(invalid("gid_span needs a positive span".into()));
                }
                gid(scope, begin)?;
                gid(scope, end)?;
            }
            Step::Expect { op, .. } => {
                if nested {
                    return Err(invalid("expectations cannot be nested".into()));
                }
                self.validate_step(spec, op, scope, true)?;
            }
        }
        Ok(())
    }

    async fn execute(&self, spec: &ScenarioSpec, state: &mut RunState) -> Result<(), StepFailure> {
        for (index, step) in spec.steps.iter().enumerate() {
            debug!(scenario = %spec.name, step = index, operation = step.name(), "step");
            let result = match step {
                Step::Expect { op, kind } => self.expect(spec, index, op, *kind, state).await,
                other => self.exec(&spec.volume, other, state).await,
            };
            result.map_err(|error| StepFailure {
                step: Some(index),
                operation: Some(step.name()),
                error,
            })?;
            state.steps_run += 1;
        }
        Ok(())
    }

    async fn expect(
        &self,
        spec: &ScenarioSpec,
        index: usize,
        op: &Step,
        expected: ErrorKind,
        state: &mut RunState,
    ) -> HarnessResult<()> {
        let result = self.exec(&spec.volume, op, state).await;
        let outcome = NegativeOutcome::classify(expected, &result);
        state.negatives.push(NegativeRecord {
            step: index,
            operation: op.name(),
            expected,
            outcome,
            message: result.as_ref().err().map(ToString::to_string),
        });
        match (outcome, result) {
            (NegativeOutcome::ExpectedFailure(kind), Err(error)) => {
                info!(scenario = %spec.name, operation = op.name(), %kind, %error, "expected failure observed");
                Ok(())
            }
            (NegativeOutcome::UnexpectedFailure(kind), Err(error)) => {
                warn!(
                    scenario = %spec.name,
                    operation = op.name(),
                    %expected,
                    actual = %kind,
                    "failure of the wrong kind"
                );
                Err(error)
            }
            _ => Err(HarnessError::UnexpectedSuccess {
                scenario: spec.name.clone(),
                operation: op.name().to_string(),
                expected,
            }),
        }
    }

    fn node(&self, name: &NodeName) -> HarnessResult<&'a Node> {
        Ok(self.topology.node(name.as_str())?)
    }

    fn device(&self, volume: &str) -> HarnessResult<PathBuf> {
        Ok(self.topology.device_for(volume)?.path.clone())
    }

    fn verifier(&self) -> Verifier<'a, C> {
        Verifier::new(self.control, VerifyConfig::from(&self.timing))
    }

    async fn exec(&self, volume: &str, step: &Step, state: &mut RunState) -> HarnessResult<()> {
        let control = self.control;
        match step {
            Step::Init { storage } => {
                let device = self.device(volume)?;
                control.init(self.node(storage)?, volume, &device).await?;
            }
            Step::FullBackup { storage, bind } => {
                let gid = control.full_backup(self.node(storage)?, volume).await?;
                info!(%storage, volume, %gid, "full backup");
                state.bindings.gids.insert(bind.clone(), gid);
            }
            Step::HashBackup { storage, bind } => {
                let gid = control.hash_backup(self.node(storage)?, volume).await?;
                info!(%storage, volume, %gid, "hash backup");
                state.bindings.gids.insert(bind.clone(), gid);
            }
            Step::SnapshotSync {
                storage,
                archives,
                bind,
            } => {
                let targets = self
                    .topology
                    .resolve(archives.iter().map(NodeName::as_str))?;
                let gid = control
                    .snapshot_sync(self.node(storage)?, volume, &targets)
                    .await?;
                debug!(%storage, volume, %gid, "synchronized snapshot");
                state.bindings.gids.insert(bind.clone(), gid);
            }
            Step::SnapshotAsync { storage, bind } => {
                let gid = control.snapshot_async(self.node(storage)?, volume).await?;
                debug!(%storage, volume, %gid, "asynchronous snapshot");
                state.bindings.gids.insert(bind.clone(), gid);
            }
            Step::ApplyDiff { archive, gid } => {
                let gid = state.gid(gid)?;
                control.apply_diff(self.node(archive)?, volume, gid).await?;
            }
            Step::MergeDiff {
                archive,
                begin,
                end,
            } => {
                let (begin, end) = (state.gid(begin)?, state.gid(end)?);
                control
                    .merge_diff(self.node(archive)?, volume, begin, end)
                    .await?;
            }
            Step::Replicate {
                src,
                dst,
                synchronizing,
            } => {
                control
                    .replicate(self.node(src)?, volume, self.node(dst)?, *synchronizing)
                    .await?;
            }
            Step::StartSync { archive } => control.start_sync(self.node(archive)?, volume).await?,
            Step::StopSync { archive } => control.stop_sync(self.node(archive)?, volume).await?,
            Step::Resize {
                size_mb,
                zero_clear,
            } => control.resize(volume, *size_mb, *zero_clear).await?,
            Step::Stop { node, mode } => control.stop(self.node(node)?, volume, *mode).await?,
            Step::Start { node } => control.start(self.node(node)?, volume).await?,
            Step::Shutdown { node, mode } => control.shutdown(self.node(node)?, *mode).await?,
            Step::Startup { node } => control.startup(self.node(node)?).await?,
            Step::RemovePersistentData { node } => {
                control.remove_persistent_data(self.node(node)?).await?;
            }
            Step::Hide { node } => {
                let node = self.node(node)?;
                control.shutdown(node, ShutdownMode::Force).await?;
                control.remove_persistent_data(node).await?;
                info!(node = %node.name, "node hidden");
            }
            Step::Restore { archive, gid, bind } => {
                let gid = state.gid(gid)?;
                let path = control.restore(self.node(archive)?, volume, gid).await?;
                let digest = self.digest_of(&path).await?;
                state.bindings.digests.insert(bind.clone(), digest);
            }
            Step::DeleteRestored { archive, gid } => {
                let gid = state.gid(gid)?;
                control
                    .delete_restored(self.node(archive)?, volume, gid)
                    .await?;
            }
            Step::StartWrites => {
                let device = self.device(volume)?;
                state.writer = Some(BackgroundWriter::start(
                    &device,
                    Arc::clone(&self.writer),
                    &self.workload,
                ));
            }
            Step::StopWrites => {
                if let Some(mut writer) = state.writer.take() {
                    let stats = writer.stop().await?;
                    state.add_writes(stats);
                }
            }
            Step::WriteOnce { bursts } => {
                let stats = self.write_once(&self.device(volume)?, *bursts).await?;
                state.add_writes(stats);
            }
            Step::Pause(d) => tokio::time::sleep(*d).await,
            Step::StepPause => tokio::time::sleep(self.timing.step_pause()).await,
            Step::SettlePause => tokio::time::sleep(self.timing.settle_pause()).await,
            Step::CaptureDigest { bind } => {
                let digest = self.digest_of(&self.device(volume)?).await?;
                debug!(volume, bind, %digest, "device digest");
                state.bindings.digests.insert(bind.clone(), digest);
            }
            Step::CaptureRestorableDigest { archive, gid, bind } => {
                let gid = state.gid(gid)?;
                let archive = self.node(archive)?;
                let path = control.restore(archive, volume, gid).await?;
                let digest = self.digest_of(&path).await;
                control.delete_restored(archive, volume, gid).await?;
                let digest = digest?;
                debug!(archive = %archive.name, volume, %gid, bind, %digest, "restored digest");
                state.bindings.digests.insert(bind.clone(), digest);
            }
            Step::CaptureRestorable {
                archive,
                filter,
                bind,
            } => {
                let list = control
                    .list_restorable(self.node(archive)?, volume, *filter)
                    .await?;
                debug!(%archive, volume, ?list, "restorable points");
                state.bindings.lists.insert(bind.clone(), list);
            }
            Step::CaptureLatestClean { archive, bind } => {
                let gid = control
                    .get_latest_clean_snapshot(self.node(archive)?, volume)
                    .await?;
                state.bindings.gids.insert(bind.clone(), gid);
            }
            Step::VerifyEqualDigest { a, b } => {
                let (left, right) = (state.digest(a)?, state.digest(b)?);
                self.verifier()
                    .verify_equal_digest(left, right)
                    .inspect_err(|_| warn!(%a, %b, "captured digests differ"))?;
            }
            Step::VerifyEqualRestorable { a, b, filter } => {
                self.verifier()
                    .verify_equal_restorable_set(self.node(a)?, self.node(b)?, volume, *filter)
                    .await?;
            }
            Step::WaitRestorable { archive, gid } => {
                let gid = state.gid(gid)?;
                self.verifier()
                    .wait_until_restorable(
                        self.node(archive)?,
                        volume,
                        gid,
                        self.timing.restorable_timeout(),
                    )
                    .await?;
            }
            Step::VerifyNotRestorable { archive, gid } => {
                let gid = state.gid(gid)?;
                self.verifier()
                    .verify_not_restorable(
                        self.node(archive)?,
                        volume,
                        gid,
                        self.timing.not_restorable_attempts,
                    )
                    .await?;
            }
            Step::VerifyMonotonic {
                observed,
                previous,
                progress,
            } => verify_monotonic_gid(state.gid(observed)?, state.gid(previous)?, *progress)?,
            Step::WaitForState { node, states } => {
                let states: Vec<&str> = states.iter().map(String::as_str).collect();
                self.verifier()
                    .wait_for_state(self.node(node)?, volume, &states, self.timing.state_timeout())
                    .await?;
            }
            Step::VerifyState { node, state: s } => {
                self.verifier().verify_state(self.node(node)?, volume, s).await?;
            }
            Step::VerifyGidRange { begin, end } => {
                verify_gid_range(state.gid(begin)?, state.gid(end)?)?;
            }
            Step::GidSpan {
                list,
                begin,
                end,
                min,
            } => {
                let (begin, end) = (state.gid(begin)?, state.gid(end)?);
                check_span(list, state.list(list)?, begin, end, *min)?;
            }
            Step::Expect { .. } => {
                return Err(ConfigError::InvalidScenario {
                    scenario: String::new(),
                    reason: "expectations cannot be nested".into(),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn digest_of(&self, path: &Path) -> HarnessResult<Digest> {
        let digest = Arc::clone(&self.digest);
        let owned = path.to_path_buf();
        let joined = tokio::task::spawn_blocking(move || digest.digest(&owned)).await;
        joined
            .unwrap_or_else(|e| Err(io::Error::other(format!("digest task aborted: {e}"))))
            .map_err(|source| HarnessError::Workload {
                device: path.to_path_buf(),
                source,
            })
    }

    async fn write_once(&self, device: &Path, bursts: u32) -> HarnessResult<WriteStats> {
        let writer = Arc::clone(&self.writer);
        let owned = device.to_path_buf();
        let burst = self.workload.burst_bytes;
        let joined = tokio::task::spawn_blocking(move || -> io::Result<WriteStats> {
            let mut stats = WriteStats::default();
            for _ in 0..bursts {
                stats.bytes += writer.write_random(&owned, burst)?;
                stats.bursts += 1;
            }
            Ok(stats)
        })
        .await;
        joined
            .unwrap_or_else(|e| Err(io::Error::other(format!("write task aborted: {e}"))))
            .map_err(|source| HarnessError::Workload {
                device: device.to_path_buf(),
                source,
            })
    }
}

/// `end` must follow `begin` by at least `min` positions in `points`.
fn check_span(name: &str, points: &[Gid], begin: Gid, end: Gid, min: usize) -> HarnessResult<()> {
    let position = |gid: Gid| {
        points.iter().position(|g| *g == gid).ok_or_else(|| {
            HarnessError::consistency(
                format!("gid {gid} in list {name}"),
                "absent",
                format!("{points:?}"),
            )
        })
    };
    let (b, e) = (position(begin)?, position(end)?);
    if e < b + min {
        return Err(HarnessError::consistency(
            format!("span {begin}..{end} in {name} (need {min})"),
            e.saturating_sub(b),
            format!("{points:?}"),
        ));
    }
    Ok(())
}

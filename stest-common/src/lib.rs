//! Scenario orchestration and invariant verification for replication
//! cluster testing.
//!
//! The harness drives a storage -> proxy -> archive replication cluster
//! through a [`ClusterControl`] facade: it runs ordered scenarios with a
//! background write workload, explores stop/start orderings over node
//! subsets, and verifies digests, restorable sets and gid ordering after each
//! scenario.

pub mod catalog;
pub mod config;
pub mod control;
pub mod device;
pub mod errors;
pub mod logging;
pub mod plan;
pub mod process;
pub mod scenario;
pub mod sim;
pub mod suite;
pub mod topology;
pub mod types;
pub mod verify;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{CatalogEntry, default_suite};
pub use config::{HarnessConfig, SuiteConfig, TimingConfig, WorkloadConfig};
pub use control::{ClusterBootstrap, ClusterControl, ProcessBootstrap};
pub use device::{Blake3Digest, ContentDigest, FileRandomWriter, RandomWriter};
pub use errors::{
    ConfigError, ControlError, ControlFailure, ControlResult, ErrorKind, HarnessError,
    HarnessResult,
};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use plan::{ExplorationMode, FaultPlan, FaultPlanner, PlanReport, nonempty_subsets};
pub use process::NodeProcesses;
pub use scenario::{
    GidRef, NegativeOutcome, ScenarioExecutor, ScenarioReport, ScenarioSpec, Step,
};
pub use sim::SimCluster;
pub use suite::{SuiteReport, SuiteRunner};
pub use topology::{Topology, TopologyBuilder};
pub use types::{
    Digest, Endpoint, Gid, Node, NodeName, NodeRole, RestorableFilter, ShutdownMode, StopMode,
    VirtualDevice,
};
pub use verify::{Progress, Verifier, VerifyConfig};
pub use writer::{BackgroundWriter, WriteStats, WriterState, with_background_writes};

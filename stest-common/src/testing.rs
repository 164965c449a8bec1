//! Shared fixtures for unit tests.

use std::path::PathBuf;

use crate::config::{HarnessConfig, TimingConfig, WorkloadConfig};
use crate::device::BLOCK_SIZE;
use crate::scenario::ScenarioExecutor;
use crate::sim::SimCluster;
use crate::topology::Topology;
use crate::types::{Node, VirtualDevice};

/// s0, p0, a0, a1 with one 16-block device behind `vol0`.
pub(crate) fn topology(dir: &std::path::Path) -> Topology {
    Topology::builder()
        .node(Node::storage("s0", "localhost", 10000))
        .node(Node::proxy("p0", "localhost", 10100))
        .node(Node::archive("a0", "localhost", 10200, "vg0"))
        .node(Node::archive("a1", "localhost", 10201, "vg1"))
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

pub(crate) fn fast_config() -> HarnessConfig {
    HarnessConfig {
        timing: TimingConfig::fast(),
        workload: WorkloadConfig {
            burst_bytes: BLOCK_SIZE,
            pause_ms: 1,
        },
        ..HarnessConfig::default()
    }
}

pub(crate) struct SimFixture {
    pub _dir: tempfile::TempDir,
    pub sim: SimCluster,
    pub device: PathBuf,
    pub config: HarnessConfig,
}

impl SimFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let topo = topology(dir.path());
        let device = topo.device_for("vol0").unwrap().path.clone();
        std::fs::write(&device, vec![0u8; 16 * BLOCK_SIZE as usize]).unwrap();
        Self {
            sim: SimCluster::new(topo),
            device,
            config: fast_config(),
            _dir: dir,
        }
    }

    pub fn executor(&self) -> ScenarioExecutor<'_, SimCluster> {
        ScenarioExecutor::new(&self.sim, self.sim.topology(), &self.config)
    }
}

use std::path::PathBuf;
use std::sync::Once;

use stest_common::device::BLOCK_SIZE;
use stest_common::types::VirtualDevice;
use stest_common::{
    HarnessConfig, ScenarioExecutor, SimCluster, TimingConfig, Topology, WorkloadConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

/// Two-archive topology over a 32-block device behind `vol0`.
pub fn topology(dir: &std::path::Path) -> Topology {
    Topology::builder()
        .storage("s0", "localhost", 10000)
        .proxy("p0", "localhost", 10100)
        .archive("a0", "localhost", 10200, "vg0")
        .archive("a1", "localhost", 10201, "vg1")
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
        .expect("test topology is valid")
}

/// Short pauses so scenarios finish in milliseconds.
pub fn fast_config() -> HarnessConfig {
    HarnessConfig {
        timing: TimingConfig::fast(),
        workload: WorkloadConfig {
            burst_bytes: BLOCK_SIZE,
            pause_ms: 1,
        },
        ..HarnessConfig::default()
    }
}

pub struct Cluster {
    pub _dir: tempfile::TempDir,
    pub sim: SimCluster,
    #[allow(dead_code)]
    pub device: PathBuf,
    pub config: HarnessConfig,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: HarnessConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let topo = topology(dir.path());
        let device = topo.device_for("vol0").expect("vol0").path.clone();
        std::fs::write(&device, vec![0u8; 32 * BLOCK_SIZE as usize]).expect("device file");
        Self {
            sim: SimCluster::new(topo),
            device,
            config,
            _dir: dir,
        }
    }

    pub fn executor(&self) -> ScenarioExecutor<'_, SimCluster> {
        ScenarioExecutor::new(&self.sim, self.sim.topology(), &self.config)
    }
}

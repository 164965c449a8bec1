//! Harness configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `STEST_*` environment variables. The CLI applies its flags last.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::plan::ExplorationMode;

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub exploration: ExplorationConfig,
    #[serde(default)]
    pub suite: SuiteConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
}

/// Pauses and polling bounds used by scenarios and the verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause between consecutive stop/start steps (ms).
    #[serde(default = "default_step_pause")]
    pub step_pause_ms: u64,
    /// Settle pause after a round of fault injection (ms).
    #[serde(default = "default_settle_pause")]
    pub settle_pause_ms: u64,
    /// Interval between convergence polls (ms).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound for a gid to become restorable (ms).
    #[serde(default = "default_restorable_timeout")]
    pub restorable_timeout_ms: u64,
    /// Upper bound for a node to reach a requested state (ms).
    #[serde(default = "default_state_timeout")]
    pub state_timeout_ms: u64,
    /// Polls made while asserting a gid does not become restorable.
    #[serde(default = "default_not_restorable_attempts")]
    pub not_restorable_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            step_pause_ms: default_step_pause(),
            settle_pause_ms: default_settle_pause(),
            poll_interval_ms: default_poll_interval(),
            restorable_timeout_ms: default_restorable_timeout(),
            state_timeout_ms: default_state_timeout(),
            not_restorable_attempts: default_not_restorable_attempts(),
        }
    }
}

impl TimingConfig {
    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }

    pub fn settle_pause(&self) -> Duration {
        Duration::from_millis(self.settle_pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn restorable_timeout(&self) -> Duration {
        Duration::from_millis(self.restorable_timeout_ms)
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }

    /// Reject bounds that would turn a polling check into a no-op.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.not_restorable_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "timing.not_restorable_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "timing.poll_interval_ms",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Timings with every pause and bound shrunk, for in-memory clusters.
    pub fn fast() -> Self {
        Self {
            step_pause_ms: 1,
            settle_pause_ms: 5,
            poll_interval_ms: 1,
            restorable_timeout_ms: 2_000,
            state_timeout_ms: 1_000,
            not_restorable_attempts: 10,
        }
    }
}

/// How the fault planner walks the plan space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplorationConfig {
    /// Sample this many plans instead of enumerating all of them.
    #[serde(default)]
    pub sample: Option<usize>,
    /// Seed for sampling. Drawn at random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ExplorationConfig {
    pub fn mode(&self) -> ExplorationMode {
        match self.sample {
            Some(size) => {
                let seed = self.seed.unwrap_or_else(|| fastrand::u64(..));
                debug!(size, seed, "sampled fault exploration");
                ExplorationMode::Sampled { size, seed }
            }
            None => ExplorationMode::Exhaustive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Number of times the whole suite runs (soak testing).
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Stop at the first failed scenario.
    #[serde(default)]
    pub fail_fast: bool,
    /// Run this many randomly drawn scenarios instead of the fixed suite.
    #[serde(default)]
    pub random_actions: Option<u32>,
    /// Seed for the random draw. Drawn at random when unset.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            repeat: default_repeat(),
            fail_fast: false,
            random_actions: None,
            random_seed: None,
        }
    }
}

impl SuiteConfig {
    /// The configured seed, or a fresh one that is logged so the run can be
    /// replayed.
    pub fn random_seed(&self) -> u64 {
        self.random_seed.unwrap_or_else(|| {
            let seed = fastrand::u64(..);
            info!(seed, "drew random action seed");
            seed
        })
    }
}

/// Background write workload knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Bytes written per burst.
    #[serde(default = "default_burst_bytes")]
    pub burst_bytes: u64,
    /// Pause between bursts (ms).
    #[serde(default = "default_write_pause")]
    pub pause_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            burst_bytes: default_burst_bytes(),
            pause_ms: default_write_pause(),
        }
    }
}

impl WorkloadConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

fn default_step_pause() -> u64 {
    100
}

fn default_settle_pause() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    300
}

fn default_restorable_timeout() -> u64 {
    100_000
}

fn default_state_timeout() -> u64 {
    10_000
}

fn default_not_restorable_attempts() -> u32 {
    10
}

fn default_repeat() -> u32 {
    1
}

fn default_burst_bytes() -> u64 {
    64 * 1024
}

fn default_write_pause() -> u64 {
    10
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl HarnessConfig {
    /// Parse a configuration file. Missing sections take their defaults.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.timing.validate()?;
        Ok(config)
    }

    /// Defaults, then the file at `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                Self::from_toml_str(&text, path)?
            }
            None => Self::default(),
        };
        let overridden = config.apply_env()?;
        config.timing.validate()?;
        if !overridden.is_empty() {
            debug!(vars = ?overridden, "configuration overridden from environment");
        }
        Ok(config)
    }

    /// Apply `STEST_*` overrides. Returns the names of variables that were
    /// set; fails with every invalid variable listed at once.
    pub fn apply_env(&mut self) -> Result<Vec<String>, ConfigError> {
        let mut parser = EnvParser::new();
        let mut set = Vec::new();
        let mut track = |var: Option<String>| set.extend(var);

        let t = &mut self.timing;
        for (name, slot) in [
            ("STEP_PAUSE", &mut t.step_pause_ms),
            ("SETTLE_PAUSE", &mut t.settle_pause_ms),
            ("POLL_INTERVAL", &mut t.poll_interval_ms),
            ("RESTORABLE_TIMEOUT", &mut t.restorable_timeout_ms),
            ("STATE_TIMEOUT", &mut t.state_timeout_ms),
        ] {
            let v = parser.get_duration(name, Duration::from_millis(*slot));
            *slot = millis(v.value);
            track(v.var);
        }

        let v = parser.get_u64_range(
            "NOT_RESTORABLE_ATTEMPTS",
            u64::from(t.not_restorable_attempts),
            1,
            u64::from(u32::MAX),
        );
        t.not_restorable_attempts = u32::try_from(v.value).unwrap_or(u32::MAX);
        track(v.var);

        let v = parser.get_u64_range("REPEAT", u64::from(self.suite.repeat), 1, u64::from(u32::MAX));
        self.suite.repeat = u32::try_from(v.value).unwrap_or(u32::MAX);
        track(v.var);

        let v = parser.get_bool("FAIL_FAST", self.suite.fail_fast);
        self.suite.fail_fast = v.value;
        track(v.var);

        let v = parser.get_optional_u64("RANDOM_ACTIONS");
        if v.is_set() {
            self.suite.random_actions = v.value.map(|n| u32::try_from(n).unwrap_or(u32::MAX));
        }
        track(v.var);

        let v = parser.get_optional_u64("RANDOM_SEED");
        if v.is_set() {
            self.suite.random_seed = v.value;
        }
        track(v.var);

        let v = parser.get_optional_u64("SAMPLE");
        if v.is_set() {
            self.exploration.sample = v.value.map(|n| usize::try_from(n).unwrap_or(usize::MAX));
        }
        track(v.var);

        let v = parser.get_optional_u64("SEED");
        if v.is_set() {
            self.exploration.seed = v.value;
        }
        track(v.var);

        let v = parser.get_u64_range(
            "BURST_BYTES",
            self.workload.burst_bytes,
            4096,
            256 * 1024 * 1024,
        );
        self.workload.burst_bytes = v.value;
        track(v.var);

        let v = parser.get_duration("WRITE_PAUSE", self.workload.pause());
        self.workload.pause_ms = millis(v.value);
        track(v.var);

        if parser.has_errors() {
            let joined = parser
                .take_errors()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConfigError::Environment(joined));
        }
        Ok(set)
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.timing.step_pause(), Duration::from_millis(100));
        assert_eq!(cfg.timing.settle_pause(), Duration::from_millis(500));
        assert_eq!(cfg.timing.poll_interval(), Duration::from_millis(300));
        assert_eq!(cfg.timing.restorable_timeout(), Duration::from_secs(100));
        assert_eq!(cfg.timing.state_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.timing.not_restorable_attempts, 10);
        assert_eq!(cfg.suite.repeat, 1);
        assert!(!cfg.suite.fail_fast);
        assert_eq!(cfg.exploration.mode(), ExplorationMode::Exhaustive);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let text = r#"
            [timing]
            settle_pause_ms = 900

            [exploration]
            sample = 5
            seed = 42
        "#;
        let cfg = HarnessConfig::from_toml_str(text, Path::new("stest.toml")).unwrap();
        assert_eq!(cfg.timing.settle_pause_ms, 900);
        assert_eq!(cfg.timing.step_pause_ms, 100);
        assert_eq!(
            cfg.exploration.mode(),
            ExplorationMode::Sampled { size: 5, seed: 42 }
        );
    }

    #[test]
    fn test_file_rejects_zero_poll_bounds() {
        let err = HarnessConfig::from_toml_str(
            "[timing]\nnot_restorable_attempts = 0\n",
            Path::new("stest.toml"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                setting: "timing.not_restorable_attempts",
                ..
            }
        ));

        let err =
            HarnessConfig::from_toml_str("[timing]\npoll_interval_ms = 0\n", Path::new("stest.toml"))
                .unwrap_err();
        assert!(err.to_string().contains("timing.poll_interval_ms"), "{err}");
    }

    #[test]
    fn test_load_reads_file() {
        let _guard = env_test_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stest.toml");
        std::fs::write(&path, "[suite]\nrepeat = 3\nfail_fast = true\n").unwrap();
        let cfg = HarnessConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.suite.repeat, 3);
        assert!(cfg.suite.fail_fast);

        let err = HarnessConfig::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _guard = env_test_lock();
        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::set_var("STEST_SETTLE_PAUSE", "2s");
            std::env::set_var("STEST_REPEAT", "4");
        }
        let mut cfg = HarnessConfig::default();
        let set = cfg.apply_env().unwrap();
        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::remove_var("STEST_SETTLE_PAUSE");
            std::env::remove_var("STEST_REPEAT");
        }
        assert_eq!(cfg.timing.settle_pause_ms, 2000);
        assert_eq!(cfg.suite.repeat, 4);
        assert_eq!(set, ["STEST_SETTLE_PAUSE", "STEST_REPEAT"]);
    }

    #[test]
    fn test_random_actions_from_file_and_env() {
        let _guard = env_test_lock();
        let text = "[suite]\nrandom_actions = 20\nrandom_seed = 5\n";
        let mut cfg = HarnessConfig::from_toml_str(text, Path::new("stest.toml")).unwrap();
        assert_eq!(cfg.suite.random_actions, Some(20));
        assert_eq!(cfg.suite.random_seed(), 5);

        // SAFETY: env access is serialized by env_test_lock
        unsafe { std::env::set_var("STEST_RANDOM_ACTIONS", "3") };
        let set = cfg.apply_env().unwrap();
        // SAFETY: env access is serialized by env_test_lock
        unsafe { std::env::remove_var("STEST_RANDOM_ACTIONS") };
        assert_eq!(cfg.suite.random_actions, Some(3));
        assert_eq!(cfg.suite.random_seed, Some(5));
        assert_eq!(set, ["STEST_RANDOM_ACTIONS"]);
    }

    #[test]
    fn test_env_errors_are_collected() {
        let _guard = env_test_lock();
        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::set_var("STEST_POLL_INTERVAL", "often");
            std::env::set_var("STEST_REPEAT", "0");
        }
        let err = HarnessConfig::default().apply_env().unwrap_err();
        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::remove_var("STEST_POLL_INTERVAL");
            std::env::remove_var("STEST_REPEAT");
        }
        let msg = err.to_string();
        assert!(msg.contains("STEST_POLL_INTERVAL"), "{msg}");
        assert!(msg.contains("STEST_REPEAT"), "{msg}");
    }
}

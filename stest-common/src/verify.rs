//! Post-condition checks over digests, restorable sets and gids.
//!
//! Synchronous checks compare values the caller already has. The polling
//! checks are the only places the harness waits for the cluster to converge;
//! every one of them takes an explicit bound.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TimingConfig;
use crate::control::ClusterControl;
use crate::errors::{ConfigError, HarnessError, HarnessResult};
use crate::types::{Digest, Gid, Node, RestorableFilter};

/// Polling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyConfig {
    pub poll_interval: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for VerifyConfig {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            poll_interval: timing.poll_interval(),
        }
    }
}

/// Whether a gid was expected to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// The new gid must be greater than the previous one.
    Expected,
    /// Replication was deliberately broken; the gid must not advance.
    Blocked,
}

/// Fails with both digests when they differ.
pub fn verify_equal_digest(a: &Digest, b: &Digest) -> HarnessResult<()> {
    if a == b {
        return Ok(());
    }
    Err(HarnessError::consistency("digests", a, b))
}

/// Checks the direction of gid movement.
pub fn verify_monotonic_gid(observed: Gid, previous: Gid, progress: Progress) -> HarnessResult<()> {
    let ok = match progress {
        Progress::Expected => observed > previous,
        Progress::Blocked => observed <= previous,
    };
    if ok {
        return Ok(());
    }
    let what = match progress {
        Progress::Expected => "gid did not advance: observed/previous",
        Progress::Blocked => "gid advanced while blocked: observed/previous",
    };
    Err(HarnessError::consistency(what, observed, previous))
}

/// A merge or apply range must not run backwards.
pub fn verify_gid_range(begin: Gid, end: Gid) -> HarnessResult<()> {
    if begin > end {
        return Err(HarnessError::consistency("gid range begin/end", begin, end));
    }
    Ok(())
}

/// Verifier bound to a control facade.
pub struct Verifier<'a, C> {
    control: &'a C,
    config: VerifyConfig,
}

impl<'a, C: ClusterControl> Verifier<'a, C> {
    pub fn new(control: &'a C, config: VerifyConfig) -> Self {
        Self { control, config }
    }

    pub fn verify_equal_digest(&self, a: &Digest, b: &Digest) -> HarnessResult<()> {
        verify_equal_digest(a, b)
    }

    pub fn verify_monotonic_gid(
        &self,
        observed: Gid,
        previous: Gid,
        progress: Progress,
    ) -> HarnessResult<()> {
        verify_monotonic_gid(observed, previous, progress)
    }

    /// Both archives must list the same gids in the same order.
    pub async fn verify_equal_restorable_set(
        &self,
        a: &Node,
        b: &Node,
        volume: &str,
        filter: RestorableFilter,
    ) -> HarnessResult<Vec<Gid>> {
        let left = self.control.list_restorable(a, volume, filter).await?;
        let right = self.control.list_restorable(b, volume, filter).await?;
        if left != right {
            return Err(HarnessError::consistency(
                format!("restorable sets of {volume} on {}/{}", a.name, b.name),
                format!("{left:?}"),
                format!("{right:?}"),
            ));
        }
        debug!(a = %a.name, b = %b.name, volume, count = left.len(), "restorable sets equal");
        Ok(left)
    }

    /// Poll until `gid` is restorable on `archive` or `timeout` passes.
    pub async fn wait_until_restorable(
        &self,
        archive: &Node,
        volume: &str,
        gid: Gid,
        timeout: Duration,
    ) -> HarnessResult<()> {
        let start = Instant::now();
        let mut polls = 0u32;
        loop {
            let observed = self
                .control
                .list_restorable(archive, volume, RestorableFilter::Clean)
                .await?;
            polls += 1;
            if observed.contains(&gid) {
                debug!(archive = %archive.name, volume, %gid, polls, elapsed = ?start.elapsed(), "gid restorable");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                warn!(archive = %archive.name, volume, %gid, ?timeout, "gid never became restorable");
                return Err(HarnessError::ConvergenceTimeout {
                    node: archive.name.clone(),
                    volume: volume.to_string(),
                    gid,
                    timeout,
                    observed,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Poll `attempts` times asserting `gid` stays unrestorable.
    pub async fn verify_not_restorable(
        &self,
        archive: &Node,
        volume: &str,
        gid: Gid,
        attempts: u32,
    ) -> HarnessResult<()> {
        if attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "not_restorable attempts",
                reason: "at least one poll is required".into(),
            }
            .into());
        }
        for attempt in 1..=attempts {
            let observed = self
                .control
                .list_restorable(archive, volume, RestorableFilter::All)
                .await?;
            if observed.contains(&gid) {
                return Err(HarnessError::UnexpectedConvergence {
                    node: archive.name.clone(),
                    volume: volume.to_string(),
                    what: format!("gid {gid} became restorable"),
                    attempts: attempt,
                    observed: format!("{observed:?}"),
                });
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
        debug!(archive = %archive.name, volume, %gid, attempts, "gid stayed unrestorable");
        Ok(())
    }

    /// Poll until the node reports one of `states` for `volume`.
    pub async fn wait_for_state(
        &self,
        node: &Node,
        volume: &str,
        states: &[&str],
        timeout: Duration,
    ) -> HarnessResult<String> {
        let start = Instant::now();
        loop {
            let state = self.control.get_state(node, volume).await?;
            if states.contains(&state.as_str()) {
                return Ok(state);
            }
            if start.elapsed() >= timeout {
                return Err(HarnessError::StateTimeout {
                    node: node.name.clone(),
                    volume: volume.to_string(),
                    expected: states.iter().map(ToString::to_string).collect(),
                    timeout,
                    observed: state,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// The node must be in `state` right now.
    pub async fn verify_state(&self, node: &Node, volume: &str, state: &str) -> HarnessResult<()> {
        let observed = self.control.get_state(node, volume).await?;
        if observed != state {
            return Err(HarnessError::consistency(
                format!("state of {volume} on {}: observed/expected", node.name),
                observed,
                state,
            ));
        }
        Ok(())
    }
}

//! Background write workload.
//!
//! A [`BackgroundWriter`] owns exactly one workload running on a blocking
//! task. The lifecycle flag is shared with the task through an `AtomicU8`;
//! everything else stays with the handle.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::WorkloadConfig;
use crate::device::RandomWriter;
use crate::errors::{HarnessError, HarnessResult};

/// Workload lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WriterState {
    Running = 0,
    StopRequested = 1,
    Stopped = 2,
}

impl WriterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::StopRequested,
            _ => Self::Stopped,
        }
    }
}

/// Counters reported when the workload stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub bursts: u64,
    pub bytes: u64,
}

struct WorkerExit {
    stats: WriteStats,
    error: Option<io::Error>,
}

/// Longest single sleep between flag checks.
const PAUSE_SLICE: Duration = Duration::from_millis(5);

/// Handle to one running write workload.
pub struct BackgroundWriter {
    device: PathBuf,
    state: Arc<AtomicU8>,
    task: Option<JoinHandle<WorkerExit>>,
    stats: WriteStats,
}

impl BackgroundWriter {
    /// Start writing to `device` and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(device: &Path, writer: Arc<dyn RandomWriter>, config: &WorkloadConfig) -> Self {
        let state = Arc::new(AtomicU8::new(WriterState::Running as u8));
        let flag = Arc::clone(&state);
        let path = device.to_path_buf();
        let burst = config.burst_bytes;
        let pause = config.pause();

        debug!(device = %device.display(), burst, ?pause, "starting background writes");
        let task = tokio::task::spawn_blocking(move || run_workload(&path, &*writer, burst, pause, &flag));

        Self {
            device: device.to_path_buf(),
            state,
            task: Some(task),
            stats: WriteStats::default(),
        }
    }

    pub fn state(&self) -> WriterState {
        WriterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Request cancellation and wait until the workload has ceased.
    ///
    /// Returns the workload's error if it failed. Stopping a stopped handle
    /// returns the last stats.
    pub async fn stop(&mut self) -> HarnessResult<WriteStats> {
        let Some(task) = self.task.take() else {
            return Ok(self.stats);
        };
        self.state
            .store(WriterState::StopRequested as u8, Ordering::Release);
        let joined = task.await;
        self.state.store(WriterState::Stopped as u8, Ordering::Release);

        let exit = joined.map_err(|e| HarnessError::Workload {
            device: self.device.clone(),
            source: io::Error::other(format!("write task aborted: {e}")),
        })?;
        self.stats = exit.stats;
        debug!(
            device = %self.device.display(),
            bursts = exit.stats.bursts,
            bytes = exit.stats.bytes,
            "background writes stopped"
        );
        match exit.error {
            Some(source) => Err(HarnessError::Workload {
                device: self.device.clone(),
                source,
            }),
            None => Ok(self.stats),
        }
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        if self.task.is_some() {
            // The blocking task sees the flag and exits on its own.
            self.state
                .store(WriterState::StopRequested as u8, Ordering::Release);
        }
    }
}

fn run_workload(
    path: &Path,
    writer: &dyn RandomWriter,
    burst: u64,
    pause: Duration,
    flag: &AtomicU8,
) -> WorkerExit {
    let running = || flag.load(Ordering::Acquire) == WriterState::Running as u8;
    let mut stats = WriteStats::default();

    while running() {
        match writer.write_random(path, burst) {
            Ok(n) => {
                stats.bursts += 1;
                stats.bytes += n;
            }
            Err(error) => {
                warn!(device = %path.display(), %error, bursts = stats.bursts, "write workload failed");
                return WorkerExit {
                    stats,
                    error: Some(error),
                };
            }
        }

        let deadline = Instant::now() + pause;
        while running() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(PAUSE_SLICE));
        }
    }
    WorkerExit { stats, error: None }
}

/// Run `body` while writes go to `device`, then always stop the workload.
///
/// A body error wins over a workload error; a workload error fails an
/// otherwise successful body.
pub async fn with_background_writes<T, F, Fut>(
    device: &Path,
    writer: Arc<dyn RandomWriter>,
    config: &WorkloadConfig,
    body: F,
) -> HarnessResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = HarnessResult<T>>,
{
    let mut handle = BackgroundWriter::start(device, writer, config);
    let result = body().await;
    let stopped = handle.stop().await;
    match (result, stopped) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(workload)) => Err(workload),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(workload)) => {
            warn!(error = %workload, "workload also failed");
            Err(e)
        }
    }
}

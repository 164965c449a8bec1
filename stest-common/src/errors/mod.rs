//! Error types for the scenario harness.
//!
//! [`HarnessError`] is the single error surfaced by scenarios, the planner and
//! the suite runner. Each variant carries the compared values so a failure can
//! be reproduced from the report alone.

pub mod catalog;

pub use catalog::ErrorKind;

use std::path::PathBuf;
use std::time::Duration;

use crate::types::{Gid, NodeName};

/// Malformed topology, configuration or scenario definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("duplicate device id: {0}")]
    DuplicateDevice(String),

    #[error("malformed endpoint for {node}: {reason}")]
    MalformedEndpoint { node: String, reason: String },

    #[error("archive group of {0} must be a non-empty string")]
    EmptyArchiveGroup(String),

    #[error("topology has no {0} node")]
    MissingRole(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node {node} is a {actual}, expected {expected}")]
    WrongRole {
        node: String,
        expected: String,
        actual: String,
    },

    #[error("volume {volume} references unknown device {device}")]
    UnknownDevice { volume: String, device: String },

    #[error("unknown volume: {0}")]
    UnknownVolume(String),

    #[error("scenario {scenario}: {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid environment overrides: {0}")]
    Environment(String),

    #[error("invalid {setting}: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },
}

/// Why a control call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlFailure {
    /// The node refused the command.
    Rejected,
    /// The node is in a state that does not accept the command.
    UnexpectedState,
    /// The call did not complete in the facade's time budget.
    Timeout,
    /// The command could not be delivered or its reply parsed.
    Transport,
}

impl std::fmt::Display for ControlFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected"),
            Self::UnexpectedState => write!(f, "unexpected_state"),
            Self::Timeout => write!(f, "timeout"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

/// A remote control call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} on {node} failed ({failure}): {message}")]
pub struct ControlError {
    pub node: NodeName,
    pub operation: &'static str,
    pub failure: ControlFailure,
    pub message: String,
}

impl ControlError {
    pub fn new(
        node: &NodeName,
        operation: &'static str,
        failure: ControlFailure,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node: node.clone(),
            operation,
            failure,
            message: message.into(),
        }
    }

    pub fn rejected(node: &NodeName, operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(node, operation, ControlFailure::Rejected, message)
    }

    pub fn bad_state(node: &NodeName, operation: &'static str, state: &str) -> Self {
        Self::new(
            node,
            operation,
            ControlFailure::UnexpectedState,
            format!("state {state}"),
        )
    }
}

/// Result type for control facade calls.
pub type ControlResult<T> = Result<T, ControlError>;

/// Error type for harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Consistency error: {what} differ: {left} vs {right}")]
    Consistency {
        what: String,
        left: String,
        right: String,
    },

    #[error(
        "Convergence timeout: gid {gid} of {volume} not restorable on {node} after {timeout:?} (observed {observed:?})"
    )]
    ConvergenceTimeout {
        node: NodeName,
        volume: String,
        gid: Gid,
        timeout: Duration,
        observed: Vec<Gid>,
    },

    #[error(
        "State timeout: {node} did not reach {expected:?} for {volume} within {timeout:?} (last {observed})"
    )]
    StateTimeout {
        node: NodeName,
        volume: String,
        expected: Vec<String>,
        timeout: Duration,
        observed: String,
    },

    #[error(
        "Unexpected convergence: {what} on {node} for {volume} within {attempts} attempts (observed {observed})"
    )]
    UnexpectedConvergence {
        node: NodeName,
        volume: String,
        what: String,
        attempts: u32,
        observed: String,
    },

    #[error("Unexpected success: {operation} in {scenario} should have failed with {expected}")]
    UnexpectedSuccess {
        scenario: String,
        operation: String,
        expected: ErrorKind,
    },

    #[error("Workload error on {}: {source}", device.display())]
    Workload {
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{failed} of {total} scenarios failed")]
    ScenarioFailures { failed: usize, total: usize },

    #[error("Process error: failed to {action} directory {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Process error: failed to {action} {node}: {source}")]
    Process {
        node: NodeName,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    /// Classify this error for negative-scenario matching and reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Control(_) => ErrorKind::Control,
            Self::Consistency { .. } => ErrorKind::Consistency,
            Self::ConvergenceTimeout { .. } | Self::StateTimeout { .. } => {
                ErrorKind::ConvergenceTimeout
            }
            Self::UnexpectedConvergence { .. } => ErrorKind::UnexpectedConvergence,
            Self::UnexpectedSuccess { .. } => ErrorKind::UnexpectedSuccess,
            Self::Workload { .. } => ErrorKind::Workload,
            Self::ScenarioFailures { .. } => ErrorKind::ScenarioFailures,
            Self::Process { .. } | Self::WorkDir { .. } => ErrorKind::Process,
        }
    }

    pub fn consistency(
        what: impl Into<String>,
        left: impl std::fmt::Display,
        right: impl std::fmt::Display,
    ) -> Self {
        Self::Consistency {
            what: what.into(),
            left: left.to_string(),
            right: right.to_string(),
        }
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

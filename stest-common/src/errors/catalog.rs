//! Error catalog for the scenario harness.
//!
//! Every harness failure maps to one [`ErrorKind`] with a stable code so that
//! reports from long soak runs can be grouped without parsing messages.
//!
//! # Error Code Ranges
//!
//! | Range      | Category     | Description                              |
//! |------------|--------------|------------------------------------------|
//! | E001-E099  | Config       | Topology and scenario definition errors  |
//! | E100-E199  | Control      | Remote control call failures             |
//! | E200-E299  | Consistency  | Digest and restorable-set mismatches     |
//! | E300-E399  | Convergence  | Eventual-state waits                     |
//! | E400-E499  | Negative     | Inverted-contract scenarios              |
//! | E500-E599  | Workload     | Background write workload failures       |
//! | E600-E699  | Suite        | Aggregated scenario failures             |
//! | E700-E799  | Process      | Node process lifecycle                   |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a harness failure.
///
/// Negative scenarios name the kind they expect, so this is `Copy` and
/// comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed topology or scenario definition.
    Config,
    /// A remote control call failed or reported an unexpected state.
    Control,
    /// Digest or restorable-set mismatch.
    Consistency,
    /// An expected eventual state was never reached.
    ConvergenceTimeout,
    /// A state that should have been blocked was reached.
    UnexpectedConvergence,
    /// A negative scenario's triggering action did not fail.
    UnexpectedSuccess,
    /// The background write workload failed.
    Workload,
    /// One or more scenarios of a suite or fault plan failed.
    ScenarioFailures,
    /// A node process could not be spawned or killed.
    Process,
}

impl ErrorKind {
    /// Stable code, `E` followed by three digits.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config => "E001",
            Self::Control => "E100",
            Self::Consistency => "E200",
            Self::ConvergenceTimeout => "E300",
            Self::UnexpectedConvergence => "E301",
            Self::UnexpectedSuccess => "E400",
            Self::Workload => "E500",
            Self::ScenarioFailures => "E600",
            Self::Process => "E700",
        }
    }

    /// Short hint printed next to failures in reports.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Config => "check node names, roles and volume/device references",
            Self::Control => "inspect the node's log; the control call was rejected or timed out",
            Self::Consistency => "compare the captured digests and gid lists in the report",
            Self::ConvergenceTimeout => "raise the timeout or check that the pipeline is running",
            Self::UnexpectedConvergence => "the blocked replication path delivered data anyway",
            Self::UnexpectedSuccess => "the action expected to fail succeeded",
            Self::Workload => "the device may have been removed while writing",
            Self::ScenarioFailures => "see the per-scenario entries of the report",
            Self::Process => "check the node binary path and that the port is free",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Config => "config",
            Self::Control => "control",
            Self::Consistency => "consistency",
            Self::ConvergenceTimeout => "convergence_timeout",
            Self::UnexpectedConvergence => "unexpected_convergence",
            Self::UnexpectedSuccess => "unexpected_success",
            Self::Workload => "workload",
            Self::ScenarioFailures => "scenario_failures",
            Self::Process => "process",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [ErrorKind; 9] = [
        ErrorKind::Config,
        ErrorKind::Control,
        ErrorKind::Consistency,
        ErrorKind::ConvergenceTimeout,
        ErrorKind::UnexpectedConvergence,
        ErrorKind::UnexpectedSuccess,
        ErrorKind::Workload,
        ErrorKind::ScenarioFailures,
        ErrorKind::Process,
    ];

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<_> = ALL.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), ALL.len());
    }

    #[test]
    fn test_codes_format() {
        for kind in ALL {
            let code = kind.code();
            assert_eq!(code.len(), 4, "{kind}");
            assert!(code.starts_with('E'));
            assert!(code[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_display_matches_serde() {
        for kind in ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }
}

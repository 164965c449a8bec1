//! Suite runner: ordered scenarios, negative scenarios and fault plans,
//! repeated for soak testing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{self, CatalogEntry};
use crate::config::HarnessConfig;
use crate::control::{ClusterBootstrap, ClusterControl};
use crate::errors::{ConfigError, HarnessError, HarnessResult};
use crate::plan::{FaultPlan, FaultPlanner};
use crate::process::NodeProcesses;
use crate::scenario::{ScenarioExecutor, ScenarioReport, ScenarioSpec};
use crate::topology::Topology;

type Template = Box<dyn Fn(&FaultPlan) -> ScenarioSpec>;

enum SuiteEntry {
    Scenario(ScenarioSpec),
    Negative(ScenarioSpec),
    FaultPlans {
        planner: FaultPlanner,
        template: Template,
    },
    RandomActions {
        seed: u64,
        specs: Vec<ScenarioSpec>,
    },
}

/// What produced a scenario report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Scenario,
    Negative,
    FaultPlan,
    RandomAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteScenario {
    pub entry: EntryKind,
    #[serde(flatten)]
    pub report: ScenarioReport,
}

/// One pass over the suite.
#[derive(Debug, Clone, Serialize)]
pub struct RepetitionReport {
    pub repetition: u32,
    /// Set when the cluster could not be rebuilt; no scenario ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    pub scenarios: Vec<SuiteScenario>,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repetitions: Vec<RepetitionReport>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Fail-fast cut the run short.
    pub aborted: bool,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.repetitions.iter().all(|r| r.setup_error.is_none())
    }

    pub fn into_result(self) -> HarnessResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let setup = self
            .repetitions
            .iter()
            .filter(|r| r.setup_error.is_some())
            .count();
        Err(HarnessError::ScenarioFailures {
            failed: self.failed + setup,
            total: self.total + setup,
        })
    }
}

/// Ordered suite over one topology.
pub struct SuiteRunner {
    topology: Topology,
    config: HarnessConfig,
    entries: Vec<SuiteEntry>,
}

impl SuiteRunner {
    pub fn new(topology: Topology, config: HarnessConfig) -> Self {
        Self {
            topology,
            config,
            entries: Vec::new(),
        }
    }

    pub fn scenario(mut self, spec: ScenarioSpec) -> Self {
        self.entries.push(SuiteEntry::Scenario(spec));
        self
    }

    /// A scenario built around `Expect` steps.
    pub fn negative(mut self, spec: ScenarioSpec) -> Self {
        self.entries.push(SuiteEntry::Negative(spec));
        self
    }

    pub fn fault_plans<F>(mut self, planner: FaultPlanner, template: F) -> Self
    where
        F: Fn(&FaultPlan) -> ScenarioSpec + 'static,
    {
        self.entries.push(SuiteEntry::FaultPlans {
            planner,
            template: Box::new(template),
        });
        self
    }

    /// Seeded soak of `count` randomly drawn scenarios on `volume`. It opens
    /// with an initializing full backup, so it belongs on a freshly reset
    /// cluster.
    pub fn random_actions(
        mut self,
        volume: &str,
        count: u32,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        let specs = catalog::random_actions(&self.topology, volume, count, seed)?;
        self.entries.push(SuiteEntry::RandomActions { seed, specs });
        Ok(self)
    }

    pub fn catalog(self, entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        entries.into_iter().fold(self, |runner, entry| match entry {
            CatalogEntry::Scenario(spec) => runner.scenario(spec),
            CatalogEntry::Negative(spec) => runner.negative(spec),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run every repetition. Node processes are released at the end whatever
    /// happened.
    pub async fn run<C, B>(
        &self,
        control: &C,
        bootstrap: &B,
        processes: &mut NodeProcesses,
    ) -> SuiteReport
    where
        C: ClusterControl,
        B: ClusterBootstrap,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let repeat = self.config.suite.repeat.max(1);
        let fail_fast = self.config.suite.fail_fast;
        info!(%run_id, repeat, entries = self.entries.len(), fail_fast, "suite started");

        let executor = ScenarioExecutor::new(control, &self.topology, &self.config);
        let mut report = SuiteReport {
            run_id,
            started_at,
            finished_at: started_at,
            repetitions: Vec::new(),
            total: 0,
            passed: 0,
            failed: 0,
            aborted: false,
        };

        for repetition in 1..=repeat {
            let mut rep = RepetitionReport {
                repetition,
                setup_error: None,
                scenarios: Vec::new(),
                passed: 0,
                failed: 0,
            };
            if let Err(e) = bootstrap.reset(&self.topology, processes).await {
                error!(%run_id, repetition, error = %e, "cluster reset failed");
                rep.setup_error = Some(e.to_string());
                report.repetitions.push(rep);
                if fail_fast {
                    report.aborted = true;
                    break;
                }
                continue;
            }

            let aborted = self.run_entries(&executor, fail_fast, &mut rep).await;
            info!(%run_id, repetition, passed = rep.passed, failed = rep.failed, "repetition finished");
            report.total += rep.passed + rep.failed;
            report.passed += rep.passed;
            report.failed += rep.failed;
            report.repetitions.push(rep);
            if aborted {
                warn!(%run_id, repetition, "fail-fast: stopping suite");
                report.aborted = true;
                break;
            }
        }

        let released = processes.release_all();
        report.finished_at = Utc::now();
        info!(
            %run_id,
            total = report.total,
            failed = report.failed,
            released,
            "suite finished"
        );
        report
    }

    /// Returns whether fail-fast tripped.
    async fn run_entries<C: ClusterControl>(
        &self,
        executor: &ScenarioExecutor<'_, C>,
        fail_fast: bool,
        rep: &mut RepetitionReport,
    ) -> bool {
        for entry in &self.entries {
            let reports = match entry {
                SuiteEntry::Scenario(spec) => vec![(EntryKind::Scenario, executor.run(spec).await)],
                SuiteEntry::Negative(spec) => {
                    let report = if spec.has_expectations() {
                        executor.run(spec).await
                    } else {
                        let err = HarnessError::from(ConfigError::InvalidScenario {
                            scenario: spec.name.clone(),
                            reason: "negative scenario has no expected failure".into(),
                        });
                        ScenarioReport::rejected(spec, &err)
                    };
                    vec![(EntryKind::Negative, report)]
                }
                SuiteEntry::RandomActions { seed, specs } => {
                    info!(seed, actions = specs.len().saturating_sub(1), "random actions");
                    let mut reports = Vec::with_capacity(specs.len());
                    for spec in specs {
                        let report = executor.run(spec).await;
                        let stop = fail_fast && !report.passed();
                        reports.push((EntryKind::RandomAction, report));
                        if stop {
                            break;
                        }
                    }
                    reports
                }
                SuiteEntry::FaultPlans { planner, template } => {
                    let planner = planner.clone().with_fail_fast(fail_fast);
                    planner
                        .run_plans(executor, template)
                        .await
                        .scenarios
                        .into_iter()
                        .map(|r| (EntryKind::FaultPlan, r))
                        .collect()
                }
            };

            for (entry, report) in reports {
                let passed = report.passed();
                if passed {
                    rep.passed += 1;
                } else {
                    rep.failed += 1;
                }
                rep.scenarios.push(SuiteScenario { entry, report });
                if !passed && fail_fast {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ControlFailure, ErrorKind};
    use crate::plan::{ExplorationMode, nonempty_subsets, stop_start_scenario};
    use crate::testing::SimFixture;
    use crate::types::NodeName;

    fn runner(f: &SimFixture) -> SuiteRunner {
        SuiteRunner::new(f.sim.topology().clone(), f.config.clone())
    }

    #[tokio::test]
    async fn test_default_suite_with_fault_plans() {
        let f = SimFixture::new();
        let nodes: Vec<NodeName> = ["s0", "p0", "a0"].into_iter().map(NodeName::from).collect();
        let planner = FaultPlanner::new(
            nonempty_subsets(&nodes),
            ExplorationMode::Sampled { size: 4, seed: 3 },
        );
        let suite = runner(&f)
            .catalog(catalog::default_suite(f.sim.topology(), "vol0").unwrap())
            .fault_plans(planner, |plan| stop_start_scenario(plan, "vol0", "s0", "a0"));

        let mut procs = NodeProcesses::new();
        let report = suite.run(&f.sim, &f.sim, &mut procs).await;
        assert!(report.success(), "{}", serde_json::to_string_pretty(&report).unwrap());
        assert_eq!(report.repetitions.len(), 1);
        let rep = &report.repetitions[0];
        assert_eq!(
            rep.scenarios
                .iter()
                .filter(|s| s.entry == EntryKind::FaultPlan)
                .count(),
            4
        );
        assert!(rep.scenarios.iter().any(|s| s.entry == EntryKind::Negative));
    }

    #[tokio::test]
    async fn test_repetitions_reset_the_cluster() {
        let f = SimFixture::new();
        let mut config = f.config.clone();
        config.suite.repeat = 3;
        let suite = SuiteRunner::new(f.sim.topology().clone(), config)
            .scenario(catalog::full_backup("s0", "a0", "vol0"));

        let report = suite.run(&f.sim, &f.sim, &mut NodeProcesses::new()).await;
        // Init only succeeds on a fresh cluster.
        assert!(report.success());
        assert_eq!((report.total, report.passed), (3, 3));
    }

    #[tokio::test]
    async fn test_record_and_continue_then_fail_fast() {
        let f = SimFixture::new();
        let build = |config: HarnessConfig| {
            SuiteRunner::new(f.sim.topology().clone(), config)
                .scenario(catalog::full_backup("s0", "a0", "vol0"))
                .scenario(catalog::snapshot("s0", "a0", "vol0"))
                .scenario(catalog::hash_backup("s0", "a0", "vol0"))
        };

        f.sim.inject_failure("s0", "snapshot_sync", ControlFailure::Timeout);
        let report = build(f.config.clone())
            .run(&f.sim, &f.sim, &mut NodeProcesses::new())
            .await;
        assert_eq!((report.passed, report.failed), (2, 1));
        assert!(!report.aborted);
        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScenarioFailures);

        let mut config = f.config.clone();
        config.suite.fail_fast = true;
        config.suite.repeat = 2;
        f.sim.inject_failure("s0", "snapshot_sync", ControlFailure::Timeout);
        let report = build(config)
            .run(&f.sim, &f.sim, &mut NodeProcesses::new())
            .await;
        assert!(report.aborted);
        assert_eq!(report.repetitions.len(), 1);
        assert_eq!((report.passed, report.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_negative_without_expectation_is_rejected() {
        let f = SimFixture::new();
        let suite = runner(&f)
            .scenario(catalog::full_backup("s0", "a0", "vol0"))
            .negative(ScenarioSpec::new("not_negative", "vol0").stop_sync("a0"))
            .negative(catalog::backup_while_sync_stopped("s0", "a0", "vol0"));
        let report = suite.run(&f.sim, &f.sim, &mut NodeProcesses::new()).await;
        let rep = &report.repetitions[0];
        assert_eq!(rep.scenarios[1].report.failure_kind(), Some(ErrorKind::Config));
        assert!(rep.scenarios[2].report.passed());
    }

    #[tokio::test]
    async fn test_random_actions_entry_runs_in_order() {
        let f = SimFixture::new();
        let suite = runner(&f).random_actions("vol0", 6, 21).unwrap();
        let report = suite.run(&f.sim, &f.sim, &mut NodeProcesses::new()).await;
        assert!(report.success(), "{}", serde_json::to_string_pretty(&report).unwrap());

        let rep = &report.repetitions[0];
        assert_eq!(rep.scenarios.len(), 7);
        assert!(rep.scenarios.iter().all(|s| s.entry == EntryKind::RandomAction));
        let ran: Vec<&str> = rep.scenarios.iter().map(|s| s.report.scenario.as_str()).collect();
        let drawn = catalog::random_actions(f.sim.topology(), "vol0", 6, 21).unwrap();
        let expected: Vec<&str> = drawn.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(ran, expected);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["repetitions"][0]["scenarios"][1]["entry"], "random_action");
        assert_eq!(json["repetitions"][0]["scenarios"][1]["params"]["seed"], "21");

        assert!(runner(&f).random_actions("nope", 1, 21).is_err());
    }

    #[tokio::test]
    async fn test_random_actions_stop_at_first_failure_with_fail_fast() {
        let f = SimFixture::new();
        let mut config = f.config.clone();
        config.suite.fail_fast = true;
        f.sim.inject_failure("s0", "full_backup", ControlFailure::Timeout);
        let suite = SuiteRunner::new(f.sim.topology().clone(), config)
            .random_actions("vol0", 5, 3)
            .unwrap();
        let report = suite.run(&f.sim, &f.sim, &mut NodeProcesses::new()).await;
        assert!(report.aborted);
        assert_eq!((report.passed, report.failed), (0, 1));
    }

    struct FailingBootstrap;

    impl ClusterBootstrap for FailingBootstrap {
        async fn reset(&self, _topology: &Topology, _processes: &mut NodeProcesses) -> HarnessResult<()> {
            Err(ConfigError::InvalidScenario {
                scenario: "bootstrap".into(),
                reason: "no binaries".into(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported() {
        let f = SimFixture::new();
        let suite = runner(&f).scenario(catalog::full_backup("s0", "a0", "vol0"));
        let report = suite
            .run(&f.sim, &FailingBootstrap, &mut NodeProcesses::new())
            .await;
        assert!(!report.success());
        assert!(report.repetitions[0].setup_error.is_some());
        assert!(f.sim.calls().is_empty());
        assert!(report.into_result().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_processes_released_at_teardown() {
        let f = SimFixture::new();
        let mut procs = NodeProcesses::new();
        let mut cmd = std::process::Command::new("sleep");
        cmd.arg("30");
        procs.spawn(&NodeName::from("s0"), cmd).unwrap();

        // The sim bootstrap releases on reset; spawn another after it.
        struct SpawningBootstrap;
        impl ClusterBootstrap for SpawningBootstrap {
            async fn reset(&self, _t: &Topology, processes: &mut NodeProcesses) -> HarnessResult<()> {
                let mut cmd = std::process::Command::new("sleep");
                cmd.arg("30");
                processes.spawn(&NodeName::from("p0"), cmd)?;
                Ok(())
            }
        }

        let suite = runner(&f).negative(ScenarioSpec::new("broken", "vol0").init("zz"));
        let report = suite.run(&f.sim, &SpawningBootstrap, &mut procs).await;
        assert_eq!(report.failed, 1);
        assert!(procs.is_empty());
    }
}

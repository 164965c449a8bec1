//! Combinatorial fault planner.
//!
//! For every node subset S the planner enumerates each ordering in which S
//! can be stopped, crossed with each ordering in which it can be restarted:
//! `|S|! * |S|!` plans per subset. Plans are addressed by a global index and
//! built on demand from the factorial number system, so neither exhaustive
//! nor sampled exploration materializes the plan space.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::control::ClusterControl;
use crate::errors::{HarnessError, HarnessResult};
use crate::scenario::{ScenarioExecutor, ScenarioReport, ScenarioSpec};
use crate::types::{NodeName, StopMode};

/// How much of the plan space to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExplorationMode {
    Exhaustive,
    /// `size` distinct plans drawn uniformly with a seeded generator.
    Sampled { size: usize, seed: u64 },
}

/// One stop/start ordering over a node subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultPlan {
    pub index: u64,
    pub subset: Vec<NodeName>,
    pub stop_order: Vec<NodeName>,
    pub start_order: Vec<NodeName>,
}

fn join(nodes: &[NodeName]) -> String {
    nodes
        .iter()
        .map(NodeName::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for FaultPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} stop [{}] start [{}]",
            self.index,
            join(&self.stop_order),
            join(&self.start_order)
        )
    }
}

/// Every non-empty subset of `nodes`, by size, then in combination order.
pub fn nonempty_subsets(nodes: &[NodeName]) -> Vec<Vec<NodeName>> {
    let n = nodes.len();
    let mut out = Vec::new();
    for k in 1..=n {
        let mut idx: Vec<usize> = (0..k).collect();
        loop {
            out.push(idx.iter().map(|&i| nodes[i].clone()).collect());
            let mut i = k;
            while i > 0 && idx[i - 1] == n - k + i - 1 {
                i -= 1;
            }
            if i == 0 {
                break;
            }
            idx[i - 1] += 1;
            for j in i..k {
                idx[j] = idx[j - 1] + 1;
            }
        }
    }
    out
}

fn factorial(k: usize) -> u64 {
    (1..=k as u64).fold(1u64, u64::saturating_mul)
}

/// The `n`-th permutation of `items` in lexicographic order of positions.
fn nth_permutation(items: &[NodeName], mut n: u64) -> Vec<NodeName> {
    let mut pool = items.to_vec();
    let mut out = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let f = factorial(pool.len() - 1);
        let pick = usize::try_from(n / f)
            .unwrap_or(usize::MAX)
            .min(pool.len() - 1);
        n %= f;
        out.push(pool.remove(pick));
    }
    out
}

/// Plans for a list of subsets under one exploration mode.
#[derive(Debug, Clone)]
pub struct FaultPlanner {
    subsets: Vec<Vec<NodeName>>,
    mode: ExplorationMode,
    fail_fast: bool,
}

impl FaultPlanner {
    pub fn new(subsets: Vec<Vec<NodeName>>, mode: ExplorationMode) -> Self {
        Self {
            subsets,
            mode,
            fail_fast: false,
        }
    }

    /// Stop `run_plans` at the first failed plan.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn subsets(&self) -> &[Vec<NodeName>] {
        &self.subsets
    }

    pub fn mode(&self) -> ExplorationMode {
        self.mode
    }

    /// Size of the whole plan space, saturating.
    pub fn total_count(&self) -> u64 {
        self.subsets
            .iter()
            .map(|s| {
                let f = factorial(s.len());
                f.saturating_mul(f)
            })
            .fold(0u64, u64::saturating_add)
    }

    /// Number of plans `plans()` yields.
    pub fn planned_count(&self) -> u64 {
        match self.mode {
            ExplorationMode::Exhaustive => self.total_count(),
            ExplorationMode::Sampled { size, .. } => (size as u64).min(self.total_count()),
        }
    }

    /// Build the plan at a global index, if it exists.
    pub fn plan_at(&self, index: u64) -> Option<FaultPlan> {
        let mut local = index;
        for subset in &self.subsets {
            let f = factorial(subset.len());
            let block = f.saturating_mul(f);
            if local < block {
                return Some(FaultPlan {
                    index,
                    subset: subset.clone(),
                    stop_order: nth_permutation(subset, local / f),
                    start_order: nth_permutation(subset, local % f),
                });
            }
            local -= block;
        }
        None
    }

    /// Lazy iterator over the planned set. Each call starts from the
    /// beginning; sampled modes yield ascending indices.
    pub fn plans(&self) -> FaultPlanIter<'_> {
        let total = self.total_count();
        let indices = match self.mode {
            ExplorationMode::Sampled { size, seed } if (size as u64) < total => {
                Indices::Picked(sample_indices(total, size as u64, seed).into_iter())
            }
            _ => Indices::Range(0..total),
        };
        FaultPlanIter {
            planner: self,
            indices,
        }
    }

    /// Run every planned scenario in order. Each plan gets its own report;
    /// failures are recorded and the run continues unless fail-fast is set.
    pub async fn run_plans<C, F>(&self, executor: &ScenarioExecutor<'_, C>, template: F) -> PlanReport
    where
        C: ClusterControl,
        F: Fn(&FaultPlan) -> ScenarioSpec,
    {
        let total = self.total_count();
        let planned = self.planned_count();
        info!(total, planned, mode = ?self.mode, "running fault plans");

        let mut report = PlanReport {
            mode: self.mode,
            total,
            planned,
            failed: 0,
            stopped_early: false,
            scenarios: Vec::new(),
        };
        for plan in self.plans() {
            let spec = template(&plan);
            let scenario = executor.run(&spec).await;
            if !scenario.passed() {
                report.failed += 1;
                warn!(plan = %plan, scenario = %spec.name, "fault plan failed");
            }
            report.scenarios.push(scenario);
            if report.failed > 0 && self.fail_fast {
                report.stopped_early = true;
                break;
            }
        }
        info!(
            run = report.scenarios.len(),
            failed = report.failed,
            "fault plans finished"
        );
        report
    }
}

/// Floyd's algorithm: `m` distinct values from `0..n`, sorted.
fn sample_indices(n: u64, m: u64, seed: u64) -> Vec<u64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut chosen = BTreeSet::new();
    for j in (n - m)..n {
        let t = rng.u64(..=j);
        if !chosen.insert(t) {
            chosen.insert(j);
        }
    }
    chosen.into_iter().collect()
}

#[derive(Debug, Clone)]
enum Indices {
    Range(Range<u64>),
    Picked(std::vec::IntoIter<u64>),
}

/// Iterator returned by [`FaultPlanner::plans`].
#[derive(Debug, Clone)]
pub struct FaultPlanIter<'a> {
    planner: &'a FaultPlanner,
    indices: Indices,
}

impl Iterator for FaultPlanIter<'_> {
    type Item = FaultPlan;

    fn next(&mut self) -> Option<FaultPlan> {
        let index = match &mut self.indices {
            Indices::Range(r) => r.next()?,
            Indices::Picked(p) => p.next()?,
        };
        self.planner.plan_at(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.indices {
            Indices::Range(r) => r.size_hint(),
            Indices::Picked(p) => p.size_hint(),
        }
    }
}

/// Outcome of a planned run.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub mode: ExplorationMode,
    pub total: u64,
    pub planned: u64,
    pub failed: usize,
    pub stopped_early: bool,
    pub scenarios: Vec<ScenarioReport>,
}

impl PlanReport {
    pub fn into_result(self) -> HarnessResult<Self> {
        if self.failed > 0 {
            return Err(HarnessError::ScenarioFailures {
                failed: self.failed,
                total: self.scenarios.len(),
            });
        }
        Ok(self)
    }
}

/// Writes run while the plan's nodes are stopped and restarted; afterwards a
/// synchronized snapshot must restore to the device's content.
pub fn stop_start_scenario(plan: &FaultPlan, volume: &str, storage: &str, archive: &str) -> ScenarioSpec {
    let mut spec = ScenarioSpec::new(format!("stop_start#{}", plan.index), volume)
        .param("subset", join(&plan.subset))
        .param("stop", join(&plan.stop_order))
        .param("start", join(&plan.start_order))
        .start_writes();
    for node in &plan.stop_order {
        spec = spec.stop(node.as_str(), StopMode::Graceful).step_pause();
    }
    spec = spec.settle_pause();
    for node in &plan.start_order {
        spec = spec.start(node.as_str()).step_pause();
    }
    spec.stop_writes()
        .capture_digest("md0")
        .snapshot_sync(storage, &[archive], "gid")
        .capture_restorable_digest(archive, "gid", "md1")
        .verify_equal_digest("md0", "md1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ControlFailure, ErrorKind};
    use crate::testing::SimFixture;
    use proptest::prelude::*;

    fn nodes(names: &[&str]) -> Vec<NodeName> {
        names.iter().map(|n| NodeName::from(*n)).collect()
    }

    fn spa() -> Vec<NodeName> {
        nodes(&["s0", "p0", "a0"])
    }

    #[test]
    fn test_subsets_by_size_then_combination() {
        let subsets = nonempty_subsets(&spa());
        let expected = vec![
            nodes(&["s0"]),
            nodes(&["p0"]),
            nodes(&["a0"]),
            nodes(&["s0", "p0"]),
            nodes(&["s0", "a0"]),
            nodes(&["p0", "a0"]),
            nodes(&["s0", "p0", "a0"]),
        ];
        assert_eq!(subsets, expected);
    }

    #[test]
    fn test_three_nodes_give_51_plans() {
        let planner = FaultPlanner::new(nonempty_subsets(&spa()), ExplorationMode::Exhaustive);
        assert_eq!(planner.total_count(), 51);
        assert_eq!(planner.plans().count(), 51);
        assert!(planner.plan_at(51).is_none());
    }

    #[test]
    fn test_stop_order_outer_start_order_inner() {
        let planner = FaultPlanner::new(nonempty_subsets(&spa()), ExplorationMode::Exhaustive);
        let first = planner.plan_at(0).unwrap();
        assert_eq!(first.subset, nodes(&["s0"]));
        assert_eq!(first.stop_order, nodes(&["s0"]));

        // Subset [s0, p0] occupies indices 3..7.
        let plans: Vec<_> = (3..7).map(|i| planner.plan_at(i).unwrap()).collect();
        assert_eq!(plans[0].stop_order, nodes(&["s0", "p0"]));
        assert_eq!(plans[0].start_order, nodes(&["s0", "p0"]));
        assert_eq!(plans[1].stop_order, nodes(&["s0", "p0"]));
        assert_eq!(plans[1].start_order, nodes(&["p0", "s0"]));
        assert_eq!(plans[2].stop_order, nodes(&["p0", "s0"]));
        assert_eq!(plans[2].start_order, nodes(&["s0", "p0"]));
        assert_eq!(plans[3].to_string(), "#6 stop [p0 s0] start [p0 s0]");
    }

    #[test]
    fn test_iteration_is_restartable_and_cloneable() {
        let planner = FaultPlanner::new(nonempty_subsets(&spa()), ExplorationMode::Exhaustive);
        let mut it = planner.plans();
        it.nth(9);
        let rest: Vec<_> = it.clone().collect();
        assert_eq!(rest, it.collect::<Vec<_>>());
        assert_eq!(rest.len(), 41);

        let again: Vec<_> = planner.plans().map(|p| p.index).collect();
        assert_eq!(again, (0..51).collect::<Vec<_>>());
    }

    #[test]
    fn test_sampling_is_seeded() {
        let subsets = nonempty_subsets(&spa());
        let a = FaultPlanner::new(subsets.clone(), ExplorationMode::Sampled { size: 7, seed: 42 });
        let b = FaultPlanner::new(subsets.clone(), ExplorationMode::Sampled { size: 7, seed: 42 });
        let ia: Vec<_> = a.plans().map(|p| p.index).collect();
        assert_eq!(ia, b.plans().map(|p| p.index).collect::<Vec<_>>());
        assert_eq!(ia.len(), 7);
        assert_eq!(a.planned_count(), 7);

        let all = FaultPlanner::new(subsets, ExplorationMode::Sampled { size: 500, seed: 1 });
        assert_eq!(all.plans().count(), 51);
        assert_eq!(all.planned_count(), 51);
    }

    #[test]
    fn test_into_result() {
        let report = PlanReport {
            mode: ExplorationMode::Exhaustive,
            total: 2,
            planned: 2,
            failed: 1,
            stopped_early: false,
            scenarios: Vec::new(),
        };
        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScenarioFailures);
    }

    async fn prepared() -> SimFixture {
        let f = SimFixture::new();
        let setup = ScenarioSpec::new("setup", "vol0")
            .init("s0")
            .full_backup("s0", "g0");
        assert!(f.executor().run(&setup).await.passed());
        f
    }

    #[tokio::test]
    async fn test_stop_start_plans_pass_on_sim() {
        let f = prepared().await;
        let planner = FaultPlanner::new(
            nonempty_subsets(&spa()),
            ExplorationMode::Sampled { size: 8, seed: 7 },
        );
        let report = planner
            .run_plans(&f.executor(), |plan| stop_start_scenario(plan, "vol0", "s0", "a0"))
            .await;
        assert_eq!(report.scenarios.len(), 8);
        for s in &report.scenarios {
            assert!(s.passed(), "{}: {:?}", s.scenario, s.outcome);
        }
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_failures_recorded_or_fail_fast() {
        let f = prepared().await;
        let subsets = vec![nodes(&["p0"])];

        f.sim.inject_failure("p0", "stop", ControlFailure::Rejected);
        let planner = FaultPlanner::new(subsets.clone(), ExplorationMode::Exhaustive);
        let report = planner
            .run_plans(&f.executor(), |plan| stop_start_scenario(plan, "vol0", "s0", "a0"))
            .await;
        assert_eq!((report.failed, report.scenarios.len()), (1, 1));

        let two = vec![nodes(&["p0"]), nodes(&["a0"])];
        f.sim.inject_failure("p0", "stop", ControlFailure::Rejected);
        let planner = FaultPlanner::new(two.clone(), ExplorationMode::Exhaustive).with_fail_fast(true);
        let report = planner
            .run_plans(&f.executor(), |plan| stop_start_scenario(plan, "vol0", "s0", "a0"))
            .await;
        assert!(report.stopped_early);
        assert_eq!(report.scenarios.len(), 1);

        f.sim.inject_failure("p0", "stop", ControlFailure::Rejected);
        let planner = FaultPlanner::new(two, ExplorationMode::Exhaustive);
        let report = planner
            .run_plans(&f.executor(), |plan| stop_start_scenario(plan, "vol0", "s0", "a0"))
            .await;
        assert_eq!((report.failed, report.scenarios.len()), (1, 2));
        assert!(report.scenarios[1].passed());
    }

    proptest! {
        #[test]
        fn prop_exhaustive_count_is_sum_of_squared_factorials(n in 1usize..=4) {
            let all = nodes(&["n0", "n1", "n2", "n3"][..n]);
            let planner = FaultPlanner::new(nonempty_subsets(&all), ExplorationMode::Exhaustive);
            let expected: u64 = planner
                .subsets()
                .iter()
                .map(|s| factorial(s.len()) * factorial(s.len()))
                .sum();
            prop_assert_eq!(planner.subsets().len(), (1usize << n) - 1);
            prop_assert_eq!(planner.total_count(), expected);
            prop_assert_eq!(planner.plans().count() as u64, expected);
        }

        #[test]
        fn prop_sample_is_distinct_and_bounded(n in 1usize..=4, m in 0usize..100, seed in any::<u64>()) {
            let all = nodes(&["n0", "n1", "n2", "n3"][..n]);
            let planner = FaultPlanner::new(
                nonempty_subsets(&all),
                ExplorationMode::Sampled { size: m, seed },
            );
            let total = planner.total_count();
            let idx: Vec<u64> = planner.plans().map(|p| p.index).collect();
            prop_assert_eq!(idx.len() as u64, (m as u64).min(total));
            prop_assert!(idx.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(idx.iter().all(|&i| i < total));
        }

        #[test]
        fn prop_orders_are_permutations_of_subset(index in 0u64..51) {
            let planner = FaultPlanner::new(nonempty_subsets(&spa()), ExplorationMode::Exhaustive);
            let plan = planner.plan_at(index).unwrap();
            let mut subset = plan.subset.clone();
            subset.sort();
            for order in [&plan.stop_order, &plan.start_order] {
                let mut sorted = order.clone();
                sorted.sort();
                prop_assert_eq!(&sorted, &subset);
            }
        }
    }
}

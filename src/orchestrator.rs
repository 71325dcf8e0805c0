//! Trial orchestration: coverage pre-seeding, sampler driving, budgets and
//! cooperative cancellation.
//!
//! Two execution modes share the same trial pipeline:
//!
//! - **Single-process**: one sampler, trials evaluated one after another.
//!   Coverage points are enqueued into the sampler before its first proposal.
//! - **Multi-process**: a pool of workers, each with its own sampler, that
//!   coordinate only through an append-only [`TrialJournal`]. Coverage points
//!   are enqueued once into the journal and handed out before any adaptive
//!   proposal, so the startup design never depends on the worker count. Every
//!   worker replays the journal before proposing.
//!
//! Cancellation only prevents new trials from starting; in-flight trials are
//! always finalized. A cancelled run comes back with `cancelled = true` and
//! the caller is responsible for discarding any journal it persisted.
//!
//! # Example
//!
//! ```no_run
//! use sieve::analytics::StandardMetrics;
//! use sieve::orchestrator::{OrchestratorConfig, RunContext, TrialOrchestrator};
//! use sieve::simulator::{Backtester, SmaCrossSimulator};
//! use sieve::space::{ObjectiveSpec, ParamSpec, SearchSpace};
//! use std::sync::Arc;
//!
//! # fn main() -> sieve::Result<()> {
//! let bars = sieve::data::load_csv("data/sample.csv", &sieve::data::DataConfig::default())?;
//! let space = SearchSpace::new(vec![
//!     ParamSpec::int("fast_period", 5, 20, 1),
//!     ParamSpec::int("slow_period", 25, 80, 5),
//! ])
//! .with_objective(ObjectiveSpec::new("net_profit_pct"));
//!
//! let backtester = Backtester::new(
//!     Arc::new(SmaCrossSimulator::default()),
//!     Arc::new(StandardMetrics::default()),
//!     10_000.0,
//! );
//! let orchestrator = TrialOrchestrator::new(space, OrchestratorConfig::default(), backtester);
//! let run = orchestrator.run(&bars, &RunContext::new())?;
//! println!("{}", run.summary());
//! # Ok(())
//! # }
//! ```

use crate::coverage::{self, CoverageConfig};
use crate::error::{OptimizeError, Result};
use crate::journal::TrialJournal;
use crate::objective::{ObjectiveEvaluator, MISSING_CONSTRAINT_VIOLATION};
use crate::sampler::{default_factory, Outcome, Sampler, SamplerFactory};
use crate::simulator::Backtester;
use crate::space::{format_params, Direction, ParamSet, SearchSpace};
use crate::study::{OptimizationRun, StopReason, Trial, TrialOrigin};
use crate::types::Bar;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Explicit per-run context handed to every component.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub show_progress: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Stopping budgets. At least one of trials or duration must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub max_trials: Option<usize>,
    pub max_duration_secs: Option<u64>,
    /// Stop after this many consecutive trials without improving the primary
    /// objective.
    pub stagnation_trials: Option<usize>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_trials: Some(100),
            max_duration_secs: None,
            stagnation_trials: None,
        }
    }
}

impl Budget {
    pub fn trials(n: usize) -> Self {
        Self {
            max_trials: Some(n),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.max_duration_secs = Some(secs);
        self
    }

    pub fn with_stagnation(mut self, trials: usize) -> Self {
        self.stagnation_trials = Some(trials);
        self
    }

    fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

/// How trials are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    SingleProcess,
    MultiProcess { workers: usize },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::SingleProcess
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub budget: Budget,
    pub mode: ExecutionMode,
    pub coverage: CoverageConfig,
    /// Bars at the start of the data that only warm up indicators.
    pub warmup_bars: usize,
    /// Upper bound on the per-worker stagnation budget in multi-process mode.
    pub stagnation_cap: usize,
    /// Violation recorded for missing constraint metrics.
    pub missing_constraint_violation: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            budget: Budget::default(),
            mode: ExecutionMode::SingleProcess,
            coverage: CoverageConfig::default(),
            warmup_bars: 0,
            stagnation_cap: 500,
            missing_constraint_violation: MISSING_CONSTRAINT_VIOLATION,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_coverage(mut self, coverage: CoverageConfig) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn with_warmup(mut self, bars: usize) -> Self {
        self.warmup_bars = bars;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.budget.max_trials.is_none() && self.budget.max_duration_secs.is_none() {
            return Err(OptimizeError::ConfigError(
                "either max_trials or max_duration_secs must be set".to_string(),
            ));
        }
        if self.budget.max_trials == Some(0) {
            return Err(OptimizeError::ConfigError("max_trials must be positive".to_string()));
        }
        if let ExecutionMode::MultiProcess { workers } = self.mode {
            if workers == 0 {
                return Err(OptimizeError::ConfigError("workers must be at least 1".to_string()));
            }
        }
        if !(self.missing_constraint_violation > 0.0) {
            return Err(OptimizeError::ConfigError(
                "missing_constraint_violation must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tracks consecutive trials without improvement of the primary objective.
#[derive(Debug, Clone)]
struct Stagnation {
    index: usize,
    direction: Direction,
    best: Option<f64>,
    since_improvement: usize,
    patience: Option<usize>,
}

impl Stagnation {
    fn new(space: &SearchSpace, patience: Option<usize>) -> Self {
        Self {
            index: space.primary_index(),
            direction: space.primary().direction(),
            best: None,
            since_improvement: 0,
            patience,
        }
    }

    fn observe(&mut self, trial: &Trial) {
        let value = trial.value(self.index).filter(|_| trial.is_feasible());
        match (value, self.best) {
            (Some(v), None) => {
                self.best = Some(v);
                self.since_improvement = 0;
            }
            (Some(v), Some(best)) if self.direction.is_better(v, best) => {
                self.best = Some(v);
                self.since_improvement = 0;
            }
            _ => self.since_improvement += 1,
        }
    }

    fn exhausted(&self) -> bool {
        self.patience.map(|p| self.since_improvement >= p).unwrap_or(false)
    }
}

/// Drives a sampler over one search space and dataset.
pub struct TrialOrchestrator {
    space: SearchSpace,
    config: OrchestratorConfig,
    backtester: Backtester,
    factory: SamplerFactory,
}

impl TrialOrchestrator {
    pub fn new(space: SearchSpace, config: OrchestratorConfig, backtester: Backtester) -> Self {
        Self {
            space,
            config,
            backtester,
            factory: default_factory(),
        }
    }

    /// Replace the built-in sampler selection with a custom factory.
    pub fn with_sampler_factory(mut self, factory: SamplerFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn backtester(&self) -> &Backtester {
        &self.backtester
    }

    /// Run with an in-memory journal.
    pub fn run(&self, bars: &[Bar], ctx: &RunContext) -> Result<OptimizationRun> {
        self.run_with_journal(bars, ctx, &TrialJournal::in_memory())
    }

    /// Run, appending every finalized trial to `journal`.
    pub fn run_with_journal(&self, bars: &[Bar], ctx: &RunContext, journal: &TrialJournal) -> Result<OptimizationRun> {
        self.space.validate()?;
        self.config.validate()?;
        if bars.is_empty() {
            return Err(OptimizeError::DataError("no bars to optimize on".to_string()));
        }

        let plan = coverage::schedule(&self.space, &self.config.coverage);
        let evaluator = ObjectiveEvaluator::new(&self.space)
            .with_missing_violation(self.config.missing_constraint_violation);

        info!(
            "Starting optimization {} ({} params, {} objectives, {} coverage points, {:?})",
            ctx.run_id,
            self.space.params.len(),
            self.space.objectives.len(),
            plan.len(),
            self.config.mode
        );

        let stop_reason = match self.config.mode {
            ExecutionMode::SingleProcess => {
                self.run_single(bars, ctx, journal, &evaluator, plan.points)?
            }
            ExecutionMode::MultiProcess { workers } => {
                journal.enqueue(plan.points);
                self.run_multi(bars, ctx, journal, &evaluator, workers)?
            }
        };

        let run = OptimizationRun::from_trials(self.space.clone(), journal.snapshot(), stop_reason, plan.advisory);
        info!("Optimization {} finished: {}", ctx.run_id, run.summary());
        Ok(run)
    }

    fn evaluate(&self, evaluator: &ObjectiveEvaluator, bars: &[Bar], number: u64, params: ParamSet, origin: TrialOrigin) -> Trial {
        match self.backtester.run(bars, &params, self.config.warmup_bars) {
            Ok(backtest) => {
                let evaluation = evaluator.evaluate(&backtest.metrics);
                if let Some(reason) = &evaluation.failure {
                    debug!("Trial {} failed: {}", number, reason);
                }
                Trial::finalize(number, params, backtest.metrics, evaluation, origin)
            }
            Err(e) => {
                debug!("Trial {} failed in collaborator [{}]: {}", number, format_params(&params), e);
                Trial::collaborator_failure(number, params, e.to_string(), origin)
            }
        }
    }

    fn progress_bar(&self, ctx: &RunContext) -> Option<ProgressBar> {
        if !ctx.show_progress {
            return None;
        }
        let pb = ProgressBar::new(self.config.budget.max_trials.unwrap_or(0) as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} trials ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Some(pb)
    }

    fn run_single(
        &self,
        bars: &[Bar],
        ctx: &RunContext,
        journal: &TrialJournal,
        evaluator: &ObjectiveEvaluator,
        coverage_points: Vec<ParamSet>,
    ) -> Result<StopReason> {
        let mut sampler = (self.factory)(&self.space, self.space.sampler.seed);
        for trial in journal.snapshot() {
            sampler.report(&trial.params, Outcome::of(&trial));
        }
        let coverage_count = coverage_points.len();
        for params in coverage_points {
            sampler.enqueue(params);
        }

        let started = Instant::now();
        let max_duration = self.config.budget.max_duration();
        let mut stagnation = Stagnation::new(&self.space, self.config.budget.stagnation_trials);
        let progress = self.progress_bar(ctx);
        let mut issued = 0usize;

        let reason = loop {
            if ctx.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if max_duration.map(|d| started.elapsed() >= d).unwrap_or(false) {
                break StopReason::TimeBudget;
            }
            if stagnation.exhausted() {
                break StopReason::Stagnation;
            }
            let ticket = match journal.next_ticket(self.config.budget.max_trials) {
                Some(ticket) => ticket,
                None => break StopReason::TrialBudget,
            };

            let origin = if issued < coverage_count {
                TrialOrigin::Coverage
            } else {
                TrialOrigin::Sampler
            };
            issued += 1;
            let params = sampler.propose();
            let trial = self.evaluate(evaluator, bars, ticket.number, params, origin);
            sampler.report(&trial.params, Outcome::of(&trial));
            if origin == TrialOrigin::Sampler {
                stagnation.observe(&trial);
            }
            journal.append(trial)?;

            if let Some(pb) = &progress {
                pb.inc(1);
            }
        };

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        Ok(reason)
    }

    fn run_multi(
        &self,
        bars: &[Bar],
        ctx: &RunContext,
        journal: &TrialJournal,
        evaluator: &ObjectiveEvaluator,
        workers: usize,
    ) -> Result<StopReason> {
        let patience = self
            .config
            .budget
            .stagnation_trials
            .map(|requested| match lowered_stagnation(requested, self.config.stagnation_cap) {
                Some(capped) => {
                    warn!(
                        "Stagnation budget is tracked per worker in multi-process mode and cannot see \
                         improvements found by other workers; using {} trials (requested {}, cap {})",
                        capped, requested, self.config.stagnation_cap
                    );
                    capped
                }
                None => {
                    debug!("Stagnation budget of {} trials is tracked per worker", requested);
                    requested
                }
            });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| OptimizeError::ConfigError(format!("cannot start worker pool: {}", e)))?;

        let started = Instant::now();
        let reasons: Mutex<Vec<StopReason>> = Mutex::new(Vec::with_capacity(workers));
        let first_error: Mutex<Option<OptimizeError>> = Mutex::new(None);

        pool.scope(|scope| {
            for worker in 0..workers {
                let reasons = &reasons;
                let first_error = &first_error;
                scope.spawn(move |_| {
                    let seed = self.space.sampler.seed.wrapping_add(worker as u64);
                    let mut sampler = (self.factory)(&self.space, seed);
                    match self.worker_loop(bars, ctx, journal, evaluator, sampler.as_mut(), patience, started) {
                        Ok(reason) => {
                            debug!("Worker {} stopped: {}", worker, reason);
                            reasons.lock().unwrap_or_else(PoisonError::into_inner).push(reason);
                        }
                        Err(e) => {
                            first_error
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .get_or_insert(e);
                        }
                    }
                });
            }
        });

        if let Some(e) = first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }
        let reasons = reasons.into_inner().unwrap_or_else(PoisonError::into_inner);
        let priority = [
            StopReason::Cancelled,
            StopReason::TrialBudget,
            StopReason::TimeBudget,
            StopReason::Stagnation,
        ];
        Ok(priority
            .into_iter()
            .find(|r| reasons.contains(r))
            .unwrap_or(StopReason::TrialBudget))
    }

    #[allow(clippy::too_many_arguments)]
    fn worker_loop(
        &self,
        bars: &[Bar],
        ctx: &RunContext,
        journal: &TrialJournal,
        evaluator: &ObjectiveEvaluator,
        sampler: &mut dyn Sampler,
        patience: Option<usize>,
        started: Instant,
    ) -> Result<StopReason> {
        let max_duration = self.config.budget.max_duration();
        let mut stagnation = Stagnation::new(&self.space, patience);
        let mut cursor = 0usize;

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if max_duration.map(|d| started.elapsed() >= d).unwrap_or(false) {
                return Ok(StopReason::TimeBudget);
            }
            if stagnation.exhausted() {
                return Ok(StopReason::Stagnation);
            }

            for trial in journal.read_from(cursor) {
                sampler.report(&trial.params, Outcome::of(&trial));
                cursor += 1;
            }

            let ticket = match journal.next_ticket(self.config.budget.max_trials) {
                Some(ticket) => ticket,
                None => return Ok(StopReason::TrialBudget),
            };
            let (params, origin) = match ticket.params {
                Some(params) => (params, TrialOrigin::Coverage),
                None => (sampler.propose(), TrialOrigin::Sampler),
            };
            let trial = self.evaluate(evaluator, bars, ticket.number, params, origin);
            if origin == TrialOrigin::Sampler {
                stagnation.observe(&trial);
            }
            journal.append(trial)?;
        }
    }
}

/// The multi-worker stagnation budget when `cap` lowers `requested`.
fn lowered_stagnation(requested: usize, cap: usize) -> Option<usize> {
    (requested > cap).then_some(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::simulator::{MetricsCalculator, Simulator};
    use crate::space::{metric, ConstraintOp, ConstraintSpec, ObjectiveSpec, ParamSpec, ParamValue, SamplerConfig, SamplerKind};
    use crate::types::{MetricMap, SimulationResult};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn bars(n: usize) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Bar::new(start + ChronoDuration::days(i as i64), 100.0, 101.0, 99.0, 100.0, 1.0))
            .collect()
    }

    /// Encodes the parameter in the equity curve so metrics can read it back.
    fn echo_simulator() -> Arc<dyn Simulator> {
        Arc::new(|_: &[Bar], params: &ParamSet, _: usize| -> Result<SimulationResult> {
            let x = params.get("x").and_then(ParamValue::as_f64).unwrap_or(0.0);
            if x == 13.0 {
                return Err(OptimizeError::SimulationError("unlucky".into()));
            }
            Ok(SimulationResult {
                equity_curve: vec![x],
                ..Default::default()
            })
        })
    }

    fn echo_metrics() -> Arc<dyn MetricsCalculator> {
        Arc::new(|result: &SimulationResult, _: f64| -> Result<MetricMap> {
            let x = result.equity_curve[0];
            let mut m = MetricMap::new();
            m.insert(metric::NET_PROFIT_PCT.into(), -(x - 30.0).powi(2));
            m.insert(metric::TOTAL_TRADES.into(), x);
            Ok(m)
        })
    }

    fn orchestrator(config: OrchestratorConfig) -> TrialOrchestrator {
        let space = SearchSpace::new(vec![ParamSpec::int("x", 0, 50, 1)])
            .with_objective(ObjectiveSpec::new(metric::NET_PROFIT_PCT))
            .with_sampler(SamplerConfig {
                kind: SamplerKind::Random,
                ..Default::default()
            });
        TrialOrchestrator::new(space, config, Backtester::new(echo_simulator(), echo_metrics(), 1.0))
    }

    #[test]
    fn test_single_process_trial_budget() {
        let orch = orchestrator(
            OrchestratorConfig::default()
                .with_budget(Budget::trials(25))
                .with_coverage(CoverageConfig::new(5)),
        );
        let run = orch.run(&bars(10), &RunContext::new()).unwrap();
        assert_eq!(run.trials.len(), 25);
        assert_eq!(run.stop_reason, StopReason::TrialBudget);
        assert_eq!(
            run.trials.iter().filter(|t| t.origin == TrialOrigin::Coverage).count(),
            5
        );
        let numbers: Vec<u64> = run.trials.iter().map(|t| t.number).collect();
        assert_eq!(numbers, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_collaborator_error_becomes_failed_trial() {
        let space = SearchSpace::new(vec![ParamSpec::int("x", 13, 13, 1)])
            .with_objective(ObjectiveSpec::new(metric::NET_PROFIT_PCT));
        let orch = TrialOrchestrator::new(
            space,
            OrchestratorConfig::default().with_budget(Budget::trials(3)),
            Backtester::new(echo_simulator(), echo_metrics(), 1.0),
        );
        let run = orch.run(&bars(10), &RunContext::new()).unwrap();
        assert_eq!(run.trials.len(), 3);
        assert!(run.trials.iter().all(|t| !t.is_complete()));
        assert!(run.ranked.is_empty());
        assert!(run.best().is_none());
    }

    #[test]
    fn test_cancelled_before_start() {
        let orch = orchestrator(OrchestratorConfig::default());
        let ctx = RunContext::new();
        ctx.cancel.cancel();
        let run = orch.run(&bars(10), &ctx).unwrap();
        assert!(run.cancelled);
        assert!(run.trials.is_empty());
    }

    #[test]
    fn test_stagnation_cap_only_lowers() {
        assert_eq!(lowered_stagnation(50, 500), None);
        assert_eq!(lowered_stagnation(500, 500), None);
        assert_eq!(lowered_stagnation(2_000, 500), Some(500));
    }

    #[test]
    fn test_stagnation_stops_early() {
        let space = SearchSpace::new(vec![ParamSpec::int("x", 0, 0, 1)])
            .with_objective(ObjectiveSpec::new(metric::NET_PROFIT_PCT));
        let orch = TrialOrchestrator::new(
            space,
            OrchestratorConfig::default().with_budget(Budget::trials(100).with_stagnation(5)),
            Backtester::new(echo_simulator(), echo_metrics(), 1.0),
        );
        let run = orch.run(&bars(10), &RunContext::new()).unwrap();
        assert_eq!(run.stop_reason, StopReason::Stagnation);
        // First trial sets the best, five more without improvement.
        assert_eq!(run.trials.len(), 6);
    }

    #[test]
    fn test_multi_process_budget_and_unique_numbers() {
        let orch = orchestrator(
            OrchestratorConfig::default()
                .with_budget(Budget::trials(40))
                .with_coverage(CoverageConfig::new(8))
                .with_mode(ExecutionMode::MultiProcess { workers: 4 }),
        );
        let run = orch.run(&bars(10), &RunContext::new()).unwrap();
        assert_eq!(run.trials.len(), 40);
        let numbers: Vec<u64> = run.trials.iter().map(|t| t.number).collect();
        assert_eq!(numbers, (0..40).collect::<Vec<_>>());
        // Coverage points keep the first numbers regardless of worker timing.
        assert!(run.trials[..8].iter().all(|t| t.origin == TrialOrigin::Coverage));
    }

    #[test]
    fn test_constraints_flow_into_run() {
        let space = SearchSpace::new(vec![ParamSpec::int("x", 0, 50, 1)])
            .with_objective(ObjectiveSpec::new(metric::NET_PROFIT_PCT))
            .with_constraint(ConstraintSpec::new(metric::TOTAL_TRADES, ConstraintOp::Gte, 35.0));
        let orch = TrialOrchestrator::new(
            space,
            OrchestratorConfig::default().with_budget(Budget::trials(60)),
            Backtester::new(echo_simulator(), echo_metrics(), 1.0),
        );
        let run = orch.run(&bars(10), &RunContext::new()).unwrap();
        for n in &run.feasible {
            assert!(run.trial(*n).unwrap().metric(metric::TOTAL_TRADES).unwrap() >= 35.0);
        }
        if let Some(best) = run.best() {
            if !run.feasible.is_empty() {
                assert!(best.is_feasible());
            }
        }
    }

    #[test]
    fn test_invalid_budget_rejected() {
        let orch = orchestrator(OrchestratorConfig::default().with_budget(Budget {
            max_trials: None,
            max_duration_secs: None,
            stagnation_trials: Some(10),
        }));
        assert!(orch.run(&bars(10), &RunContext::new()).is_err());
    }
}

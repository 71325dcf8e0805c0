//! Post-process validation chain.
//!
//! Up to four stages re-validate the best candidates of an optimization run,
//! always in the order deflation, forward test, stress test, OOS test. Each
//! enabled stage consumes the ranking produced by the last stage that
//! actually ran, and every result records that source together with the
//! candidate's rank in it at the moment the result is created:
//!
//! ```text
//! rank_change = source_rank - module_rank
//! ```
//!
//! A positive change means the candidate moved up. A stage that sees fewer
//! upstream candidates than `top_k`, or that lacks the period it needs, is
//! skipped and the next stage sources from the one before it.
//!
//! The OOS test never re-ranks: it reports holdout figures in its source's
//! order.

pub mod deflation;
pub mod forward_test;
pub mod oos_test;

pub use deflation::{population_stats, DeflationConfig, DeflationStats};
pub use forward_test::{evaluate_holdout, ForwardRankBy, ForwardTestConfig, HoldoutEvaluation};
pub use oos_test::OosTestConfig;
pub use stress_test::StressTestConfig;

use crate::data::Period;
use crate::error::{OptimizeError, Result};
use crate::simulator::Backtester;
use crate::space::{Direction, ParamSet};
use crate::study::{OptimizationRun, Trial};
use crate::types::{Bar, MetricMap};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, info};

/// A ranking producer. `Raw` is the optimizer's own ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    #[serde(rename = "raw", alias = "optuna_raw")]
    Raw,
    Deflation,
    ForwardTest,
    StressTest,
    OosTest,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Raw => "raw",
            StageKind::Deflation => "deflation",
            StageKind::ForwardTest => "forward_test",
            StageKind::StressTest => "stress_test",
            StageKind::OosTest => "oos_test",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parameter set under validation, carrying the metrics of its trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub trial_number: u64,
    pub params: ParamSet,
    /// Metrics over the optimization period.
    #[serde(with = "crate::types::metric_map_serde")]
    pub is_metrics: MetricMap,
}

impl Candidate {
    pub fn from_trial(trial: &Trial) -> Self {
        Self {
            trial_number: trial.number,
            params: trial.params.clone(),
            is_metrics: trial.metrics.clone(),
        }
    }
}

/// A candidate with its 1-based position in the ranking that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub rank: usize,
}

/// Stage-specific figures attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageMetrics {
    Deflation {
        /// Annualized Sharpe of the candidate's trial.
        sharpe: f64,
        /// Probability that the true Sharpe beats the expected maximum.
        probability: f64,
        expected_max_sharpe: f64,
        /// Mean Sharpe of the full trial population.
        mean_sharpe: f64,
        n_trials: usize,
    },
    ForwardTest(HoldoutEvaluation),
    StressTest {
        metric: String,
        base_value: f64,
        retention: f64,
        worst_retention: f64,
        perturbations: usize,
    },
    OosTest(HoldoutEvaluation),
}

/// One candidate's outcome in one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessResult {
    pub module: StageKind,
    /// The stage whose ranking this stage consumed.
    pub source: StageKind,
    pub trial_number: u64,
    pub params: ParamSet,
    pub source_rank: usize,
    pub module_rank: usize,
    pub rank_change: i64,
    pub metrics: StageMetrics,
}

/// Output of one stage that ran, ordered by `module_rank`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub module: StageKind,
    pub source: StageKind,
    pub results: Vec<PostProcessResult>,
}

impl StageResult {
    pub fn module_rank(&self, trial_number: u64) -> Option<usize> {
        self.results
            .iter()
            .find(|r| r.trial_number == trial_number)
            .map(|r| r.module_rank)
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedStage {
    pub module: StageKind,
    pub reason: String,
}

/// Everything the chain produced for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessReport {
    pub stages: Vec<StageResult>,
    pub skipped: Vec<SkippedStage>,
    /// The last stage that produced a ranking.
    pub final_source: StageKind,
    /// First candidate of the final ranking.
    pub selected: Option<Candidate>,
}

impl PostProcessReport {
    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.module == kind)
    }

    pub fn selected_params(&self) -> Option<&ParamSet> {
        self.selected.as_ref().map(|c| &c.params)
    }

    fn skip(&mut self, module: StageKind, reason: String) {
        info!("Skipping {} stage: {}", module, reason);
        self.skipped.push(SkippedStage { module, reason });
    }
}

/// Chain settings. A stage without a config table is disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Candidates evaluated per stage; also the minimum upstream size.
    pub top_k: usize,
    pub deflation: Option<DeflationConfig>,
    pub forward_test: Option<ForwardTestConfig>,
    pub stress_test: Option<StressTestConfig>,
    pub oos_test: Option<OosTestConfig>,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            deflation: None,
            forward_test: None,
            stress_test: None,
            oos_test: None,
        }
    }
}

impl PostProcessConfig {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_deflation(mut self, config: DeflationConfig) -> Self {
        self.deflation = Some(config);
        self
    }

    pub fn with_forward_test(mut self, config: ForwardTestConfig) -> Self {
        self.forward_test = Some(config);
        self
    }

    pub fn with_stress_test(mut self, config: StressTestConfig) -> Self {
        self.stress_test = Some(config);
        self
    }

    pub fn with_oos_test(mut self, config: OosTestConfig) -> Self {
        self.oos_test = Some(config);
        self
    }

    /// Whether any stage is enabled.
    pub fn is_enabled(&self) -> bool {
        self.deflation.is_some() || self.forward_test.is_some() || self.stress_test.is_some() || self.oos_test.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(OptimizeError::ConfigError("postprocess top_k must be at least 1".to_string()));
        }
        if let Some(d) = &self.deflation {
            if !(d.annualization_factor > 0.0) {
                return Err(OptimizeError::ConfigError(
                    "deflation annualization_factor must be positive".to_string(),
                ));
            }
        }
        if let Some(f) = &self.forward_test {
            if f.period_days == 0 {
                return Err(OptimizeError::ConfigError("forward_test period_days must be positive".to_string()));
            }
        }
        if let Some(s) = &self.stress_test {
            if s.steps < 1 {
                return Err(OptimizeError::ConfigError("stress_test steps must be at least 1".to_string()));
            }
            if !(s.float_fraction > 0.0 && s.float_fraction <= 1.0) {
                return Err(OptimizeError::ConfigError(
                    "stress_test float_fraction must be in (0, 1]".to_string(),
                ));
            }
        }
        if let Some(o) = &self.oos_test {
            if o.period_days == 0 {
                return Err(OptimizeError::ConfigError("oos_test period_days must be positive".to_string()));
            }
        }
        Ok(())
    }

    fn forward_days(&self) -> Option<u32> {
        self.forward_test.as_ref().map(|f| f.period_days)
    }

    fn oos_days(&self) -> Option<u32> {
        self.oos_test.as_ref().map(|o| o.period_days)
    }
}

/// The periods the chain evaluates on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainPeriods<'a> {
    /// The period the run optimized on.
    pub optimize: Period<'a>,
    pub forward: Option<Period<'a>>,
    pub oos: Option<Period<'a>>,
}

/// Split a dataset into `[optimize | forward test | OOS test]` for a
/// standalone run. Holdouts are only carved out for enabled stages and are
/// measured back from the last bar in calendar days.
pub fn split_holdout<'a>(bars: &'a [Bar], warmup_bars: usize, config: &PostProcessConfig) -> Result<ChainPeriods<'a>> {
    let last = bars
        .last()
        .map(|b| b.timestamp)
        .ok_or_else(|| OptimizeError::DataError("no bars to split".to_string()))?;
    let oos_cut = last - Duration::days(config.oos_days().unwrap_or(0) as i64);
    let forward_cut = oos_cut - Duration::days(config.forward_days().unwrap_or(0) as i64);

    let optimize_end = bars.partition_point(|b| b.timestamp <= forward_cut);
    let forward_end = bars.partition_point(|b| b.timestamp <= oos_cut);
    if optimize_end == 0 {
        return Err(OptimizeError::DataError(
            "holdout periods leave no bars to optimize on".to_string(),
        ));
    }

    let forward = match config.forward_days() {
        Some(_) if forward_end > optimize_end => {
            Some(Period::with_lookback(bars, optimize_end, forward_end, warmup_bars))
        }
        Some(days) => {
            return Err(OptimizeError::DataError(format!(
                "forward-test period of {} days contains no bars",
                days
            )))
        }
        None => None,
    };
    let oos = match config.oos_days() {
        Some(_) if bars.len() > forward_end => Some(Period::with_lookback(bars, forward_end, bars.len(), warmup_bars)),
        Some(days) => {
            return Err(OptimizeError::DataError(format!(
                "OOS-test period of {} days contains no bars",
                days
            )))
        }
        None => None,
    };

    debug!(
        "Split {} bars into optimize={} forward={:?} oos={:?}",
        bars.len(),
        optimize_end,
        forward.map(|p| p.eval_bars().len()),
        oos.map(|p| p.eval_bars().len())
    );
    Ok(ChainPeriods {
        optimize: Period::new(&bars[..optimize_end], warmup_bars),
        forward,
        oos,
    })
}

/// A candidate scored by a stage, before module ranks are assigned.
#[derive(Debug, Clone)]
pub(crate) struct Scored {
    pub entry: RankedCandidate,
    pub score: f64,
    pub metrics: StageMetrics,
}

/// Better scores first, undefined scores last.
fn score_order(direction: Direction, a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => direction.best_first(a, b),
    }
}

/// Assign module ranks. `order = None` keeps the source order.
fn finalize(module: StageKind, source: StageKind, mut scored: Vec<Scored>, order: Option<Direction>) -> StageResult {
    if let Some(direction) = order {
        scored.sort_by(|a, b| score_order(direction, a.score, b.score).then(a.entry.rank.cmp(&b.entry.rank)));
    }
    let results = scored
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let module_rank = i + 1;
            PostProcessResult {
                module,
                source,
                trial_number: s.entry.candidate.trial_number,
                params: s.entry.candidate.params,
                source_rank: s.entry.rank,
                module_rank,
                rank_change: s.entry.rank as i64 - module_rank as i64,
                metrics: s.metrics,
            }
        })
        .collect();
    StageResult { module, source, results }
}

/// Runs the enabled stages over one optimization run.
pub struct PostProcessChain<'a> {
    config: &'a PostProcessConfig,
    backtester: &'a Backtester,
}

impl<'a> PostProcessChain<'a> {
    pub fn new(config: &'a PostProcessConfig, backtester: &'a Backtester) -> Self {
        Self { config, backtester }
    }

    /// Run every enabled stage.
    pub fn run(&self, run: &OptimizationRun, periods: &ChainPeriods<'_>) -> Result<PostProcessReport> {
        let mut report = self.rank_candidates(run, periods)?;
        self.run_oos_test(&mut report, run, &periods.optimize, periods.oos.as_ref());
        Ok(report)
    }

    /// Run the deflation, forward and stress stages. The OOS test is left to
    /// [`run_oos_test`](Self::run_oos_test), whose period may depend on the
    /// selection made here.
    pub fn rank_candidates(&self, run: &OptimizationRun, periods: &ChainPeriods<'_>) -> Result<PostProcessReport> {
        self.config.validate()?;
        let top_k = self.config.top_k;

        let mut upstream = raw_ranking(run);
        let mut source = StageKind::Raw;
        let mut report = PostProcessReport {
            stages: Vec::new(),
            skipped: Vec::new(),
            final_source: StageKind::Raw,
            selected: None,
        };

        if let Some(config) = &self.config.deflation {
            if upstream.len() < top_k {
                report.skip(StageKind::Deflation, shortfall(upstream.len(), top_k));
            } else {
                let scored = deflation::evaluate(config, run, &upstream, top_k, self.backtester, &periods.optimize);
                let stage = finalize(StageKind::Deflation, source, scored, Some(Direction::Maximize));
                advance(&mut report, &mut upstream, &mut source, run, stage);
            }
        }

        if let Some(config) = &self.config.forward_test {
            match periods.forward {
                None => report.skip(StageKind::ForwardTest, "no forward-test period".to_string()),
                Some(_) if upstream.len() < top_k => {
                    report.skip(StageKind::ForwardTest, shortfall(upstream.len(), top_k))
                }
                Some(forward) => {
                    let scored = forward_test::evaluate(config, &upstream, top_k, self.backtester, &periods.optimize, &forward);
                    let stage = finalize(StageKind::ForwardTest, source, scored, Some(config.ranking_direction()));
                    advance(&mut report, &mut upstream, &mut source, run, stage);
                }
            }
        }

        if let Some(config) = &self.config.stress_test {
            if upstream.len() < top_k {
                report.skip(StageKind::StressTest, shortfall(upstream.len(), top_k));
            } else {
                let scored = stress_test::evaluate(config, &run.space, &upstream, top_k, self.backtester, &periods.optimize);
                let stage = finalize(StageKind::StressTest, source, scored, Some(Direction::Maximize));
                advance(&mut report, &mut upstream, &mut source, run, stage);
            }
        }

        report.final_source = source;
        report.selected = upstream.into_iter().next().map(|r| r.candidate);
        Ok(report)
    }

    /// Append the OOS test to a report produced by
    /// [`rank_candidates`](Self::rank_candidates), sourcing from its last stage.
    pub fn run_oos_test(
        &self,
        report: &mut PostProcessReport,
        run: &OptimizationRun,
        optimize: &Period<'_>,
        oos: Option<&Period<'_>>,
    ) {
        let config = match &self.config.oos_test {
            Some(config) => config,
            None => return,
        };
        let top_k = self.config.top_k;
        let mut upstream = upstream_of(report, run);
        match oos {
            None => report.skip(StageKind::OosTest, "no OOS-test period".to_string()),
            Some(_) if upstream.len() < top_k => report.skip(StageKind::OosTest, shortfall(upstream.len(), top_k)),
            Some(oos) => {
                let scored = oos_test::evaluate(config, &upstream, top_k, self.backtester, optimize, oos);
                let mut source = report.final_source;
                let stage = finalize(StageKind::OosTest, source, scored, None);
                advance(report, &mut upstream, &mut source, run, stage);
                report.final_source = source;
                report.selected = upstream.into_iter().next().map(|r| r.candidate);
            }
        }
    }
}

fn shortfall(available: usize, top_k: usize) -> String {
    format!("{} upstream candidates, top_k is {}", available, top_k)
}

/// The optimizer's ranking, 1-based.
fn raw_ranking(run: &OptimizationRun) -> Vec<RankedCandidate> {
    run.ranked_trials()
        .into_iter()
        .enumerate()
        .map(|(i, t)| RankedCandidate {
            candidate: Candidate::from_trial(t),
            rank: i + 1,
        })
        .collect()
}

fn stage_ranking(stage: &StageResult, run: &OptimizationRun) -> Vec<RankedCandidate> {
    stage
        .results
        .iter()
        .filter_map(|r| {
            run.trial(r.trial_number).map(|t| RankedCandidate {
                candidate: Candidate::from_trial(t),
                rank: r.module_rank,
            })
        })
        .collect()
}

/// The ranking produced by the last stage of `report` that ran.
fn upstream_of(report: &PostProcessReport, run: &OptimizationRun) -> Vec<RankedCandidate> {
    match report.stage(report.final_source) {
        Some(stage) => stage_ranking(stage, run),
        None => raw_ranking(run),
    }
}

/// Record a finished stage and make its ranking the next stage's input.
fn advance(
    report: &mut PostProcessReport,
    upstream: &mut Vec<RankedCandidate>,
    source: &mut StageKind,
    run: &OptimizationRun,
    stage: StageResult,
) {
    if stage.is_empty() {
        report.skip(stage.module, "no candidate qualified".to_string());
        return;
    }
    *upstream = stage_ranking(&stage, run);
    *source = stage.module;
    info!(
        "{} stage ranked {} candidates (source: {})",
        stage.module,
        stage.results.len(),
        stage.source
    );
    report.stages.push(stage);
}

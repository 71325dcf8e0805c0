//! Walk-forward analysis.
//!
//! Walk-forward analysis repeatedly optimizes over a rolling in-sample (IS)
//! period and evaluates the chosen parameters on the out-of-sample (OOS)
//! period that follows. Each window runs through a small state machine:
//!
//! ```text
//! BuildWindow -> OptimizeIs -> EvaluateOos -> BuildWindow | Done
//! ```
//!
//! The last IS bar is also the first OOS bar, and the last OOS bar of one
//! window is the last IS bar of the next: windows share their boundary bar.
//! In fixed mode the OOS length is a calendar-day constant. In adaptive mode
//! it grows bar by bar until a trigger in [`crate::adaptive`] fires or the
//! maximum OOS length is reached.
//!
//! Windows are strictly sequential. A window whose OOS end would not be
//! after its OOS start, as happens across a gap in the data, is dropped and
//! the next window starts past it. Every step moves the IS end forward, so
//! the run always reaches the end of the data. Cancellation is checked
//! before each window is built and surfaces as [`OptimizeError::Cancelled`].

use crate::adaptive::{self, AdaptiveConfig, Baseline, Trigger};
use crate::data::{index_at_or_after, index_at_or_before, Period};
use crate::error::{OptimizeError, Result};
use crate::orchestrator::{OrchestratorConfig, RunContext, TrialOrchestrator};
use crate::postprocess::{Candidate, ChainPeriods, PostProcessChain, PostProcessConfig, PostProcessReport};
use crate::sampler::SamplerFactory;
use crate::simulator::Backtester;
use crate::space::{metric, ParamSet, SearchSpace};
use crate::stitching::{self, StitchedSeries, StitchedSummary, WindowFigures};
use crate::study::OptimizationRun;
use crate::types::{Bar, MetricMap, SimulationResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How OOS lengths are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    Fixed,
    Adaptive,
}

/// Configuration for walk-forward analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    pub mode: WindowMode,
    /// In-sample length in calendar days.
    pub is_days: u32,
    /// Out-of-sample length in calendar days (fixed mode).
    pub oos_days: u32,
    pub adaptive: AdaptiveConfig,
    /// Stop after this many windows.
    pub max_windows: Option<usize>,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            mode: WindowMode::Fixed,
            is_days: 180,
            oos_days: 30,
            adaptive: AdaptiveConfig::default(),
            max_windows: None,
        }
    }
}

impl WalkForwardConfig {
    /// Fixed-length windows.
    pub fn fixed(is_days: u32, oos_days: u32) -> Self {
        Self {
            mode: WindowMode::Fixed,
            is_days,
            oos_days,
            ..Default::default()
        }
    }

    /// Adaptive windows with the given maximum OOS length.
    pub fn adaptive(is_days: u32, max_oos_days: u32) -> Self {
        Self {
            mode: WindowMode::Adaptive,
            is_days,
            adaptive: AdaptiveConfig::default().with_max_oos_days(max_oos_days),
            ..Default::default()
        }
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_max_windows(mut self, n: usize) -> Self {
        self.max_windows = Some(n);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_days == 0 {
            return Err(OptimizeError::ConfigError("walkforward is_days must be positive".to_string()));
        }
        match self.mode {
            WindowMode::Fixed if self.oos_days == 0 => Err(OptimizeError::ConfigError(
                "walkforward oos_days must be positive".to_string(),
            )),
            WindowMode::Fixed => Ok(()),
            WindowMode::Adaptive => self.adaptive.validate(),
        }
    }

    fn oos_cap_days(&self) -> u32 {
        match self.mode {
            WindowMode::Fixed => self.oos_days,
            WindowMode::Adaptive => self.adaptive.max_oos_days,
        }
    }
}

/// Why a window's OOS segment ends where it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowTrigger {
    Fixed,
    Adaptive(Trigger),
}

impl WindowTrigger {
    pub fn is_adaptive(&self) -> bool {
        matches!(self, WindowTrigger::Adaptive(_))
    }
}

/// One completed walk-forward window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    pub index: usize,
    pub trigger: WindowTrigger,
    pub is_start: DateTime<Utc>,
    pub is_end: DateTime<Utc>,
    /// End of the part of IS used for optimization; earlier than `is_end`
    /// when the forward test holds out the IS tail.
    pub optimize_end: DateTime<Utc>,
    pub oos_start: DateTime<Utc>,
    pub oos_end: DateTime<Utc>,
    pub run: OptimizationRun,
    pub postprocess: PostProcessReport,
    pub selected_trial: u64,
    pub selected_params: ParamSet,
    #[serde(with = "crate::types::metric_map_serde")]
    pub is_metrics: MetricMap,
    #[serde(with = "crate::types::metric_map_serde")]
    pub oos_metrics: MetricMap,
    pub oos_equity: Vec<f64>,
    pub oos_timestamps: Vec<DateTime<Utc>>,
}

impl Window {
    /// Calendar days optimized on.
    pub fn is_days(&self) -> f64 {
        days_between(self.is_start, self.optimize_end)
    }

    pub fn oos_days(&self) -> f64 {
        days_between(self.oos_start, self.oos_end)
    }

    pub fn is_return_pct(&self) -> f64 {
        self.is_metrics.get(metric::NET_PROFIT_PCT).copied().unwrap_or(f64::NAN)
    }

    pub fn oos_return_pct(&self) -> f64 {
        self.oos_metrics.get(metric::NET_PROFIT_PCT).copied().unwrap_or(f64::NAN)
    }
}

fn days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_seconds() as f64 / 86_400.0
}

/// Complete walk-forward analysis results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub run_id: Uuid,
    pub config: WalkForwardConfig,
    pub windows: Vec<Window>,
    /// Windows dropped for a degenerate OOS segment or an empty study.
    pub dropped_windows: usize,
    pub stitched: StitchedSeries,
    pub summary: StitchedSummary,
}

impl WalkForwardResult {
    /// Get a summary of the walk-forward analysis.
    pub fn summary_text(&self) -> String {
        format!(
            "Walk-Forward Analysis Summary:\n\
             Windows: {} ({} dropped)\n\
             Stitched OOS Return: {:.2}%\n\
             Stitched Max Drawdown: {:.2}%\n\
             Mean OOS Return: {:.2}%\n\
             Profitable Windows: {:.1}%\n\
             WF Efficiency: {:.2}",
            self.windows.len(),
            self.dropped_windows,
            self.summary.total_return_pct,
            self.summary.max_drawdown_pct,
            self.summary.mean_oos_return_pct,
            self.summary.profitable_window_ratio * 100.0,
            self.summary.walk_forward_efficiency
        )
    }
}

/// Bar indices of a window under construction.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    index: usize,
    is_start: usize,
    is_end: usize,
    optimize_end: usize,
    /// Furthest bar the OOS segment may reach.
    oos_limit: usize,
    /// Whether `oos_limit` was set by the maximum OOS length rather than by
    /// the end of the data.
    reached_cap: bool,
}

impl Bounds {
    fn oos_start(&self) -> usize {
        self.is_end
    }

    /// IS end of the window following a dropped one.
    fn skip_to(&self) -> usize {
        self.oos_limit.max(self.is_end + 1)
    }
}

/// Outcome of laying out the next window.
enum Layout {
    Window(Bounds),
    /// No OOS bar follows the IS period; retry with the given IS end.
    Skip { index: usize, at: DateTime<Utc>, next_is_end: usize },
    Exhausted,
}

enum Phase {
    BuildWindow { is_end: Option<usize> },
    OptimizeIs(Bounds),
    EvaluateOos {
        bounds: Bounds,
        run: Box<OptimizationRun>,
        report: Box<PostProcessReport>,
        selected: Candidate,
    },
    Done,
}

/// Walk-forward analyzer.
pub struct WalkForwardAnalyzer {
    space: SearchSpace,
    config: WalkForwardConfig,
    optimizer: OrchestratorConfig,
    postprocess: PostProcessConfig,
    backtester: Backtester,
    factory: Option<SamplerFactory>,
}

impl WalkForwardAnalyzer {
    pub fn new(space: SearchSpace, config: WalkForwardConfig, optimizer: OrchestratorConfig, backtester: Backtester) -> Self {
        Self {
            space,
            config,
            optimizer,
            postprocess: PostProcessConfig::default(),
            backtester,
            factory: None,
        }
    }

    pub fn with_postprocess(mut self, postprocess: PostProcessConfig) -> Self {
        self.postprocess = postprocess;
        self
    }

    pub fn with_sampler_factory(mut self, factory: SamplerFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn config(&self) -> &WalkForwardConfig {
        &self.config
    }

    /// Run every window over `bars`.
    pub fn run(&self, bars: &[Bar], ctx: &RunContext) -> Result<WalkForwardResult> {
        self.config.validate()?;
        self.space.validate()?;
        self.optimizer.validate()?;
        self.postprocess.validate()?;
        if bars.len() < 2 {
            return Err(OptimizeError::DataError("not enough bars for walk-forward analysis".to_string()));
        }

        info!(
            "Starting walk-forward {} ({:?}, IS {} days, OOS up to {} days, {} bars)",
            ctx.run_id,
            self.config.mode,
            self.config.is_days,
            self.config.oos_cap_days(),
            bars.len()
        );

        let chain = PostProcessChain::new(&self.postprocess, &self.backtester);
        let mut windows: Vec<Window> = Vec::new();
        let mut dropped = 0usize;
        let mut stitched = StitchedSeries::new(self.backtester.initial_balance());
        let mut phase = Phase::BuildWindow { is_end: None };

        loop {
            phase = match phase {
                Phase::BuildWindow { is_end } => {
                    if ctx.cancel.is_cancelled() {
                        info!("Walk-forward {} cancelled after {} windows", ctx.run_id, windows.len());
                        return Err(OptimizeError::Cancelled);
                    }
                    let index = windows.len() + dropped;
                    if self.config.max_windows.map(|max| windows.len() >= max).unwrap_or(false) {
                        Phase::Done
                    } else {
                        match self.build_window(bars, index, is_end) {
                            Layout::Window(bounds) => Phase::OptimizeIs(bounds),
                            Layout::Skip { index, at, next_is_end } => {
                                info!("Window {} has a zero-length OOS segment at {}, dropped", index, at);
                                dropped += 1;
                                Phase::BuildWindow {
                                    is_end: Some(next_is_end),
                                }
                            }
                            Layout::Exhausted if index == 0 => {
                                return Err(OptimizeError::DataError(format!(
                                    "not enough data for one {}-day IS window",
                                    self.config.is_days
                                )))
                            }
                            Layout::Exhausted => Phase::Done,
                        }
                    }
                }
                Phase::OptimizeIs(bounds) => {
                    let optimize = self.optimize_period(bars, &bounds);
                    let run = self.optimize(&optimize, ctx)?;
                    let periods = ChainPeriods {
                        optimize,
                        forward: self.forward_period(bars, &bounds),
                        oos: None,
                    };
                    let report = chain.rank_candidates(&run, &periods)?;
                    match report.selected.clone() {
                        Some(selected) => Phase::EvaluateOos {
                            bounds,
                            run: Box::new(run),
                            report: Box::new(report),
                            selected,
                        },
                        None => {
                            warn!("Window {} produced no completed trial, dropped", bounds.index);
                            dropped += 1;
                            Phase::BuildWindow {
                                is_end: Some(bounds.skip_to()),
                            }
                        }
                    }
                }
                Phase::EvaluateOos {
                    bounds,
                    run,
                    mut report,
                    selected,
                } => match self.oos_end(bars, &bounds, &selected) {
                    Some((oos_end, trigger)) if oos_end > bounds.oos_start() => {
                        let optimize = self.optimize_period(bars, &bounds);
                        let oos = Period::with_lookback(bars, bounds.oos_start(), oos_end + 1, self.optimizer.warmup_bars);
                        chain.run_oos_test(&mut report, &run, &optimize, Some(&oos));

                        let (oos_metrics, oos_result) = self.evaluate(&oos, &selected.params, bounds.index);
                        let window = Window {
                            index: bounds.index,
                            trigger,
                            is_start: bars[bounds.is_start].timestamp,
                            is_end: bars[bounds.is_end].timestamp,
                            optimize_end: bars[bounds.optimize_end].timestamp,
                            oos_start: bars[bounds.oos_start()].timestamp,
                            oos_end: bars[oos_end].timestamp,
                            run: *run,
                            postprocess: *report,
                            selected_trial: selected.trial_number,
                            selected_params: selected.params,
                            is_metrics: selected.is_metrics,
                            oos_metrics,
                            oos_equity: oos_result.equity_curve,
                            oos_timestamps: oos_result.timestamps,
                        };
                        info!(
                            "Window {}: IS {} .. {}, OOS {} .. {} ({:?}), OOS return {:.2}%",
                            window.index,
                            window.is_start,
                            window.is_end,
                            window.oos_start,
                            window.oos_end,
                            window.trigger,
                            window.oos_return_pct()
                        );
                        stitched.append(window.index, &window.oos_equity, &window.oos_timestamps);
                        windows.push(window);
                        Phase::BuildWindow { is_end: Some(oos_end) }
                    }
                    _ => {
                        info!(
                            "Window {} has a zero-length OOS segment at {}, dropped",
                            bounds.index,
                            bars[bounds.oos_start()].timestamp
                        );
                        dropped += 1;
                        Phase::BuildWindow {
                            is_end: Some(bounds.skip_to()),
                        }
                    }
                }
                Phase::Done => break,
            };
        }

        let figures: Vec<WindowFigures> = windows
            .iter()
            .filter(|w| stitched.windows.contains(&w.index))
            .map(|w| WindowFigures {
                is_return_pct: w.is_return_pct(),
                is_days: w.is_days(),
                oos_return_pct: w.oos_return_pct(),
                oos_days: w.oos_days(),
            })
            .filter(|f| f.is_return_pct.is_finite() && f.oos_return_pct.is_finite())
            .collect();
        let summary = stitching::summarize(&stitched, &figures);
        if windows.is_empty() {
            warn!("Walk-forward {} produced no windows", ctx.run_id);
        }
        info!(
            "Walk-forward {} finished: {} windows, {} dropped, stitched return {:.2}%",
            ctx.run_id,
            windows.len(),
            dropped,
            summary.total_return_pct
        );

        Ok(WalkForwardResult {
            run_id: ctx.run_id,
            config: self.config.clone(),
            windows,
            dropped_windows: dropped,
            stitched,
            summary,
        })
    }

    /// IS/OOS bar indices for a window ending its IS at `is_end`, or the
    /// first window when `None`.
    ///
    /// An IS period that would hold only the bars after a gap longer than
    /// the IS length restarts at the first bar after the gap.
    fn build_window(&self, bars: &[Bar], index: usize, is_end: Option<usize>) -> Layout {
        let last = bars.len() - 1;
        let is_span = Duration::days(self.config.is_days as i64);
        let anchored = |start: usize| index_at_or_before(bars, bars[start].timestamp + is_span).map(|end| (start, end));
        let (is_start, is_end) = match is_end {
            None => match anchored(self.optimizer.warmup_bars.min(last)) {
                Some(span) => span,
                None => return Layout::Exhausted,
            },
            Some(end) if end >= last => return Layout::Exhausted,
            Some(end) => match index_at_or_after(bars, bars[end].timestamp - is_span) {
                start if start < end => (start, end),
                _ => match anchored(end) {
                    Some((start, anchored_end)) if anchored_end > start => (start, anchored_end),
                    _ => {
                        return Layout::Skip {
                            index,
                            at: bars[end].timestamp,
                            next_is_end: end + 1,
                        }
                    }
                },
            },
        };
        if is_end <= is_start || is_end >= last {
            return Layout::Exhausted;
        }

        let optimize_end = match &self.postprocess.forward_test {
            Some(forward) => {
                let cut = bars[is_end].timestamp - Duration::days(forward.period_days as i64);
                match index_at_or_before(bars, cut) {
                    Some(i) if i > is_start && i < is_end => i,
                    _ => {
                        debug!("Window {} IS too short for a forward-test tail", index);
                        is_end
                    }
                }
            }
            None => is_end,
        };

        let target = bars[is_end].timestamp + Duration::days(self.config.oos_cap_days() as i64);
        let oos_limit = index_at_or_before(bars, target).unwrap_or(is_end);
        if oos_limit <= is_end {
            return Layout::Skip {
                index,
                at: bars[is_end].timestamp,
                next_is_end: is_end + 1,
            };
        }
        Layout::Window(Bounds {
            index,
            is_start,
            is_end,
            optimize_end,
            oos_limit,
            reached_cap: bars[last].timestamp >= target,
        })
    }

    fn optimize_period<'a>(&self, bars: &'a [Bar], bounds: &Bounds) -> Period<'a> {
        Period::with_lookback(bars, bounds.is_start, bounds.optimize_end + 1, self.optimizer.warmup_bars)
    }

    fn forward_period<'a>(&self, bars: &'a [Bar], bounds: &Bounds) -> Option<Period<'a>> {
        if bounds.optimize_end < bounds.is_end {
            Some(Period::with_lookback(
                bars,
                bounds.optimize_end + 1,
                bounds.is_end + 1,
                self.optimizer.warmup_bars,
            ))
        } else {
            None
        }
    }

    fn optimize(&self, period: &Period<'_>, ctx: &RunContext) -> Result<OptimizationRun> {
        let config = self.optimizer.clone().with_warmup(period.warmup());
        let mut orchestrator = TrialOrchestrator::new(self.space.clone(), config, self.backtester.clone());
        if let Some(factory) = &self.factory {
            orchestrator = orchestrator.with_sampler_factory(factory.clone());
        }
        let run = orchestrator.run(period.bars(), ctx)?;
        if run.cancelled {
            return Err(OptimizeError::Cancelled);
        }
        Ok(run)
    }

    /// Last OOS bar and the reason it was chosen. `None` when the scanned
    /// curve cannot be placed on the OOS bars.
    fn oos_end(&self, bars: &[Bar], bounds: &Bounds, selected: &Candidate) -> Option<(usize, WindowTrigger)> {
        if self.config.mode == WindowMode::Fixed {
            return Some((bounds.oos_limit, WindowTrigger::Fixed));
        }
        let fallback = if bounds.reached_cap {
            Trigger::MaxLength
        } else {
            Trigger::EndOfData
        };

        let optimize = self.optimize_period(bars, bounds);
        let baseline = match self.backtester.run(optimize.bars(), &selected.params, optimize.warmup()) {
            Ok(backtest) => Baseline::from_result(&backtest.result),
            Err(e) => {
                debug!("Window {} IS baseline failed: {}", bounds.index, e);
                return Some((bounds.oos_limit, WindowTrigger::Adaptive(fallback)));
            }
        };
        let longest = Period::with_lookback(
            bars,
            bounds.oos_start(),
            bounds.oos_limit + 1,
            self.optimizer.warmup_bars,
        );
        match self.backtester.run(longest.bars(), &selected.params, longest.warmup()) {
            Ok(backtest) => {
                let outcome = adaptive::scan(&self.config.adaptive, &baseline, &backtest.result, bounds.reached_cap);
                // The curve may cover lookback bars too, so place it by timestamp.
                let end = backtest
                    .result
                    .timestamps
                    .get(outcome.end)
                    .and_then(|ts| bars.binary_search_by_key(ts, |b| b.timestamp).ok());
                match end {
                    Some(end) if end > bounds.oos_start() => {
                        Some((end.min(bounds.oos_limit), WindowTrigger::Adaptive(outcome.trigger)))
                    }
                    _ => {
                        warn!(
                            "Window {} OOS scan ended at offset {} outside the OOS bars",
                            bounds.index, outcome.end
                        );
                        None
                    }
                }
            }
            Err(e) => {
                debug!("Window {} OOS scan failed: {}", bounds.index, e);
                Some((bounds.oos_limit, WindowTrigger::Adaptive(fallback)))
            }
        }
    }

    fn evaluate(&self, period: &Period<'_>, params: &ParamSet, index: usize) -> (MetricMap, SimulationResult) {
        match self.backtester.run(period.bars(), params, period.warmup()) {
            Ok(backtest) => (backtest.metrics, backtest.result),
            Err(e) => {
                warn!("Window {} OOS evaluation failed: {}", index, e);
                (MetricMap::new(), SimulationResult::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageConfig;
    use crate::orchestrator::{Budget, CancellationToken};
    use crate::postprocess::{ForwardTestConfig, OosTestConfig, StageKind};
    use crate::space::{ObjectiveSpec, ParamSpec, ParamValue, SamplerConfig, SamplerKind};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn bars(n: usize) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Bar::new(start + Duration::days(i as i64), 100.0, 101.0, 99.0, 100.0, 1.0))
            .collect()
    }

    /// Equity drifts with `x`; the curve is flat for `x = 0`.
    fn backtester() -> Backtester {
        let simulate = |bars: &[Bar], params: &ParamSet, warmup: usize| -> Result<SimulationResult> {
            let x = params.get("x").and_then(ParamValue::as_f64).unwrap_or(0.0);
            let mut equity = 1000.0;
            let mut curve = Vec::new();
            let mut timestamps = Vec::new();
            for (i, bar) in bars.iter().enumerate().skip(warmup) {
                if i > warmup {
                    equity *= 1.0 + 0.0002 * x + 0.002 * (i as f64 * 1.3).sin();
                }
                curve.push(equity);
                timestamps.push(bar.timestamp);
            }
            Ok(SimulationResult {
                trades: Vec::new(),
                balance_curve: curve.clone(),
                equity_curve: curve,
                timestamps,
            })
        };
        Backtester::new(
            Arc::new(simulate),
            Arc::new(crate::analytics::StandardMetrics::default()),
            1000.0,
        )
    }

    fn space() -> SearchSpace {
        SearchSpace::new(vec![ParamSpec::int("x", 0, 10, 1)])
            .with_objective(ObjectiveSpec::new(metric::NET_PROFIT_PCT))
            .with_sampler(SamplerConfig {
                kind: SamplerKind::Random,
                ..Default::default()
            })
    }

    fn optimizer() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_budget(Budget::trials(12))
            .with_coverage(CoverageConfig::new(4))
    }

    #[test]
    fn test_fixed_windows_share_boundaries() {
        let data = bars(400);
        let analyzer = WalkForwardAnalyzer::new(space(), WalkForwardConfig::fixed(120, 60), optimizer(), backtester());
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        assert_eq!(result.windows.len(), 5);
        for w in &result.windows {
            assert_eq!(w.trigger, WindowTrigger::Fixed);
            assert_eq!(w.is_end, w.oos_start);
            assert!(w.oos_end > w.oos_start);
            assert_eq!(w.run.trials.len(), 12);
        }
        for pair in result.windows.windows(2) {
            assert_eq!(pair[0].oos_end, pair[1].is_end);
        }
        assert!((result.windows[0].oos_days() - 60.0).abs() < 1e-9);
        assert_eq!(result.stitched.boundaries.len(), 5);
        assert!(result.stitched.timestamps.windows(2).all(|w| w[0] < w[1]));
        assert!(result.summary_text().contains("Windows: 5"));
    }

    #[test]
    fn test_adaptive_without_trigger_uses_cap() {
        let data = bars(200);
        let config = WalkForwardConfig::adaptive(90, 60)
            .with_adaptive(AdaptiveConfig {
                cusum_h: 1.0e9,
                drawdown_mult: 1.0e9,
                max_oos_days: 60,
                ..Default::default()
            })
            .with_max_windows(1);
        let analyzer = WalkForwardAnalyzer::new(space(), config, optimizer(), backtester());
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        assert_eq!(result.windows.len(), 1);
        let w = &result.windows[0];
        assert_eq!(w.trigger, WindowTrigger::Adaptive(Trigger::MaxLength));
        assert!((w.oos_days() - 60.0).abs() < 1e-9);
        assert!((days_between(w.is_start, w.is_end) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_windows_never_degenerate() {
        let data = bars(260);
        let config = WalkForwardConfig::adaptive(60, 30);
        let analyzer = WalkForwardAnalyzer::new(space(), config, optimizer(), backtester());
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        assert!(!result.windows.is_empty());
        assert!(result.windows.iter().all(|w| w.oos_end > w.oos_start));
        assert!(result.windows.iter().all(|w| w.trigger.is_adaptive()));
    }

    #[test]
    fn test_forward_tail_and_oos_stage_inside_window() {
        let data = bars(300);
        let postprocess = PostProcessConfig::default()
            .with_top_k(3)
            .with_forward_test(ForwardTestConfig {
                period_days: 20,
                ..Default::default()
            })
            .with_oos_test(OosTestConfig::default());
        let config = WalkForwardConfig::fixed(100, 50).with_max_windows(2);
        let analyzer =
            WalkForwardAnalyzer::new(space(), config, optimizer(), backtester()).with_postprocess(postprocess);
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        assert_eq!(result.windows.len(), 2);
        for w in &result.windows {
            assert!((days_between(w.optimize_end, w.is_end) - 20.0).abs() < 1e-9);
            let oos = w.postprocess.stage(StageKind::OosTest).unwrap();
            assert_eq!(oos.source, StageKind::ForwardTest);
            assert_eq!(w.postprocess.final_source, StageKind::OosTest);
            assert_eq!(Some(w.selected_trial), oos.results.first().map(|r| r.trial_number));
        }
    }

    #[test]
    fn test_cancelled_before_first_window() {
        let data = bars(300);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = RunContext::new().with_cancel(cancel);
        let analyzer = WalkForwardAnalyzer::new(space(), WalkForwardConfig::fixed(100, 50), optimizer(), backtester());
        assert!(matches!(analyzer.run(&data, &ctx), Err(OptimizeError::Cancelled)));
    }

    /// `before` daily bars, a gap of `gap_days`, then `after` daily bars.
    fn gapped_bars(before: usize, gap_days: i64, after: usize) -> Vec<Bar> {
        let mut data = bars(before + after);
        for bar in data.iter_mut().skip(before) {
            bar.timestamp = bar.timestamp + Duration::days(gap_days);
        }
        data
    }

    #[test]
    fn test_fixed_windows_continue_after_gap() {
        let data = gapped_bars(200, 40, 200);
        let resume = data[200].timestamp;
        let analyzer = WalkForwardAnalyzer::new(space(), WalkForwardConfig::fixed(60, 20), optimizer(), backtester());
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        assert_eq!(result.dropped_windows, 1);
        assert!(result.windows.iter().any(|w| w.oos_start >= resume));
        assert_eq!(result.windows.last().map(|w| w.oos_end), data.last().map(|b| b.timestamp));
        for w in &result.windows {
            assert!(w.oos_end > w.oos_start);
        }
        assert!(result.stitched.timestamps.windows(2).all(|p| p[0] < p[1]));
    }

    #[test]
    fn test_adaptive_windows_continue_after_gap() {
        let data = gapped_bars(200, 40, 200);
        let resume = data[200].timestamp;
        let analyzer = WalkForwardAnalyzer::new(space(), WalkForwardConfig::adaptive(60, 30), optimizer(), backtester());
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        assert!(result.dropped_windows >= 1);
        assert!(result.windows.iter().any(|w| w.oos_start >= resume));
        assert_eq!(result.windows.last().map(|w| w.oos_end), data.last().map(|b| b.timestamp));
        for w in &result.windows {
            assert!(w.oos_end > w.oos_start);
            assert!(w.oos_days() <= 30.0 + 1e-9);
        }
    }

    #[test]
    fn test_gap_longer_than_is_restarts_after_gap() {
        let data = gapped_bars(150, 200, 150);
        let resume = data[150].timestamp;
        let analyzer = WalkForwardAnalyzer::new(space(), WalkForwardConfig::fixed(60, 20), optimizer(), backtester());
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        let after: Vec<&Window> = result.windows.iter().filter(|w| w.oos_start > resume).collect();
        assert!(!after.is_empty());
        assert!(after.iter().all(|w| w.is_start >= resume));
        assert_eq!(result.windows.last().map(|w| w.oos_end), data.last().map(|b| b.timestamp));
    }

    #[test]
    fn test_failed_windows_still_advance_across_gap() {
        let data = gapped_bars(200, 40, 200);
        let failing = |_: &[Bar], _: &ParamSet, _: usize| -> Result<SimulationResult> {
            Err(OptimizeError::SimulationError("no fills".to_string()))
        };
        let backtester = Backtester::new(
            Arc::new(failing),
            Arc::new(crate::analytics::StandardMetrics::default()),
            1000.0,
        );
        let config = WalkForwardConfig::fixed(60, 20).with_max_windows(1);
        let analyzer = WalkForwardAnalyzer::new(space(), config, optimizer(), backtester);
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        assert!(result.windows.is_empty());
        assert!(result.dropped_windows > 10);
    }

    #[test]
    fn test_scan_curve_with_lookback_is_placed_by_timestamp() {
        let data = bars(300);
        // Reports every bar it is given, lookback included.
        let simulate = |bars: &[Bar], _: &ParamSet, _: usize| -> Result<SimulationResult> {
            let curve: Vec<f64> = (0..bars.len()).map(|i| 1000.0 + (i as f64 * 0.9).sin() * 5.0).collect();
            Ok(SimulationResult {
                trades: Vec::new(),
                balance_curve: curve.clone(),
                equity_curve: curve,
                timestamps: bars.iter().map(|b| b.timestamp).collect(),
            })
        };
        let backtester = Backtester::new(
            Arc::new(simulate),
            Arc::new(crate::analytics::StandardMetrics::default()),
            1000.0,
        );
        let analyzer = WalkForwardAnalyzer::new(
            space(),
            WalkForwardConfig::adaptive(60, 200),
            optimizer().with_warmup(30),
            backtester,
        );
        let result = analyzer.run(&data, &RunContext::new()).unwrap();

        let last = data.last().map(|b| b.timestamp).unwrap();
        for w in &result.windows {
            assert!(w.oos_end > w.oos_start);
            assert!(w.oos_end <= last);
        }
    }

    #[test]
    fn test_not_enough_data() {
        let data = bars(50);
        let analyzer = WalkForwardAnalyzer::new(space(), WalkForwardConfig::fixed(100, 50), optimizer(), backtester());
        assert!(analyzer.run(&data, &RunContext::new()).is_err());
    }
}

//! Forward test stage: re-run candidates over the period that follows the
//! optimization period and measure how much of their performance survives.

use super::{Candidate, RankedCandidate, Scored, StageMetrics};
use crate::data::Period;
use crate::simulator::Backtester;
use crate::space::{metric, Direction};
use crate::types::MetricMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the forward test ranks candidates by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardRankBy {
    /// Holdout-to-IS ratio, higher is better.
    Degradation,
    /// The raw holdout value of the metric, in the metric's direction.
    Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardTestConfig {
    /// Length of the holdout in a standalone run. Inside a walk-forward
    /// window it is the tail of the IS period.
    pub period_days: u32,
    pub metric: String,
    pub rank_by: ForwardRankBy,
}

impl Default for ForwardTestConfig {
    fn default() -> Self {
        Self {
            period_days: 30,
            metric: metric::NET_PROFIT_PCT.to_string(),
            rank_by: ForwardRankBy::Degradation,
        }
    }
}

impl ForwardTestConfig {
    pub fn with_rank_by(mut self, rank_by: ForwardRankBy) -> Self {
        self.rank_by = rank_by;
        self
    }

    pub(crate) fn ranking_direction(&self) -> Direction {
        match self.rank_by {
            ForwardRankBy::Degradation => Direction::Maximize,
            ForwardRankBy::Metric => Direction::for_metric(&self.metric).unwrap_or(Direction::Maximize),
        }
    }
}

/// A candidate measured on a holdout period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldoutEvaluation {
    pub metric: String,
    pub is_value: f64,
    pub holdout_value: f64,
    /// Holdout value relative to the IS value (per day for net profit).
    pub degradation: f64,
    #[serde(with = "crate::types::metric_map_serde")]
    pub holdout_metrics: MetricMap,
}

/// Ratio of holdout to IS performance.
///
/// Net profit is compared per calendar day so periods of different length
/// are comparable; other metrics are compared as they are. NaN when the IS
/// value is zero or either side is undefined.
pub fn degradation_ratio(metric_name: &str, is_value: f64, is_days: f64, holdout_value: f64, holdout_days: f64) -> f64 {
    let (is_rate, holdout_rate) = if metric_name == metric::NET_PROFIT_PCT {
        if !(is_days > 0.0) || !(holdout_days > 0.0) {
            return f64::NAN;
        }
        (is_value / is_days, holdout_value / holdout_days)
    } else {
        (is_value, holdout_value)
    };
    if is_rate == 0.0 {
        return f64::NAN;
    }
    let ratio = holdout_rate / is_rate;
    if ratio.is_finite() {
        ratio
    } else {
        f64::NAN
    }
}

/// Re-run `candidate` over `holdout` and compare with its IS figures. A
/// failing collaborator yields undefined holdout values, not an error.
pub fn evaluate_holdout(
    backtester: &Backtester,
    candidate: &Candidate,
    metric_name: &str,
    is_days: f64,
    holdout: &Period<'_>,
) -> HoldoutEvaluation {
    let is_value = candidate.is_metrics.get(metric_name).copied().unwrap_or(f64::NAN);
    let holdout_metrics = match backtester.run(holdout.bars(), &candidate.params, holdout.warmup()) {
        Ok(backtest) => backtest.metrics,
        Err(e) => {
            debug!("Holdout run of trial {} failed: {}", candidate.trial_number, e);
            MetricMap::new()
        }
    };
    let holdout_value = holdout_metrics.get(metric_name).copied().unwrap_or(f64::NAN);
    HoldoutEvaluation {
        metric: metric_name.to_string(),
        is_value,
        holdout_value,
        degradation: degradation_ratio(metric_name, is_value, is_days, holdout_value, holdout.days()),
        holdout_metrics,
    }
}

pub(crate) fn evaluate(
    config: &ForwardTestConfig,
    upstream: &[RankedCandidate],
    top_k: usize,
    backtester: &Backtester,
    optimize: &Period<'_>,
    forward: &Period<'_>,
) -> Vec<Scored> {
    let is_days = optimize.days();
    upstream
        .iter()
        .take(top_k)
        .map(|entry| {
            let evaluation = evaluate_holdout(backtester, &entry.candidate, &config.metric, is_days, forward);
            let score = match config.rank_by {
                ForwardRankBy::Degradation => evaluation.degradation,
                ForwardRankBy::Metric => evaluation.holdout_value,
            };
            Scored {
                entry: entry.clone(),
                score: if score.is_finite() { score } else { f64::NAN },
                metrics: StageMetrics::ForwardTest(evaluation),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::{fixtures, split_holdout, PostProcessChain, PostProcessConfig, StageKind};

    #[test]
    fn test_degradation_ratio_per_day() {
        // 10% over 100 days in sample, 3% over 30 days out of sample.
        let ratio = degradation_ratio(metric::NET_PROFIT_PCT, 10.0, 100.0, 3.0, 30.0);
        assert!((ratio - 1.0).abs() < 1e-12);
        let ratio = degradation_ratio(metric::SHARPE_RATIO, 2.0, 100.0, 1.0, 30.0);
        assert!((ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_degradation_ratio_undefined() {
        assert!(degradation_ratio(metric::NET_PROFIT_PCT, 0.0, 100.0, 3.0, 30.0).is_nan());
        assert!(degradation_ratio(metric::NET_PROFIT_PCT, 10.0, 0.0, 3.0, 30.0).is_nan());
        assert!(degradation_ratio(metric::SHARPE_RATIO, 2.0, 1.0, f64::NAN, 1.0).is_nan());
    }

    #[test]
    fn test_holdout_collaborator_failure_is_undefined() {
        use crate::analytics::StandardMetrics;
        use crate::error::{OptimizeError, Result};
        use crate::space::ParamSet;
        use crate::types::{Bar, SimulationResult};
        use std::sync::Arc;

        let failing = Backtester::new(
            Arc::new(|_: &[Bar], _: &ParamSet, _: usize| -> Result<SimulationResult> {
                Err(OptimizeError::SimulationError("boom".into()))
            }),
            Arc::new(StandardMetrics::default()),
            1000.0,
        );
        let bars = fixtures::bars(40);
        let mut is_metrics = MetricMap::new();
        is_metrics.insert(metric::NET_PROFIT_PCT.into(), 5.0);
        let candidate = Candidate {
            trial_number: 3,
            params: fixtures::params(3),
            is_metrics,
        };
        let eval = evaluate_holdout(&failing, &candidate, metric::NET_PROFIT_PCT, 100.0, &Period::new(&bars, 0));
        assert_eq!(eval.is_value, 5.0);
        assert!(eval.holdout_value.is_nan());
        assert!(eval.degradation.is_nan());
        assert!(eval.holdout_metrics.is_empty());
    }

    #[test]
    fn test_rank_by_metric_orders_by_holdout_value() {
        let bars = fixtures::bars(300);
        let config = PostProcessConfig::default()
            .with_top_k(8)
            .with_forward_test(ForwardTestConfig::default().with_rank_by(ForwardRankBy::Metric));
        let periods = split_holdout(&bars, 0, &config).unwrap();
        let run = fixtures::run(&periods.optimize);
        let bt = fixtures::backtester();

        let report = PostProcessChain::new(&config, &bt).run(&run, &periods).unwrap();
        let stage = report.stage(StageKind::ForwardTest).unwrap();
        assert_eq!(stage.results.len(), 8);
        let values: Vec<f64> = stage
            .results
            .iter()
            .map(|r| match &r.metrics {
                StageMetrics::ForwardTest(e) => e.holdout_value,
                _ => f64::NAN,
            })
            .collect();
        assert!(values.windows(2).all(|w| w[0] >= w[1]));
    }
}

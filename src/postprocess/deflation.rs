//! Deflated Sharpe ratio stage.
//!
//! The more trials a search runs, the higher the best Sharpe ratio it finds
//! by luck alone. This stage estimates that "expected maximum" from the
//! moments of the whole trial population (Bailey & López de Prado) and
//! ranks candidates by the probability that their true Sharpe exceeds it.
//!
//! Population statistics always come from every completed trial with a
//! finite Sharpe ratio. `min_sharpe` only narrows which candidates are
//! tested against the reference; it never changes the reference itself.

use super::{RankedCandidate, Scored, StageMetrics};
use crate::analytics::{kurtosis, mean, skewness, variance};
use crate::data::Period;
use crate::simulator::Backtester;
use crate::space::metric;
use crate::study::{OptimizationRun, Trial};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

/// Euler-Mascheroni constant.
const EULER_GAMMA: f64 = 0.5772156649;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeflationConfig {
    /// Candidates whose annualized Sharpe is below this are not tested.
    pub min_sharpe: Option<f64>,
    /// Periods per year behind the annualized Sharpe metric.
    pub annualization_factor: f64,
}

impl Default for DeflationConfig {
    fn default() -> Self {
        Self {
            min_sharpe: None,
            annualization_factor: 252.0,
        }
    }
}

impl DeflationConfig {
    pub fn with_min_sharpe(mut self, min_sharpe: f64) -> Self {
        self.min_sharpe = Some(min_sharpe);
        self
    }
}

/// Moments of the annualized Sharpe ratios of a trial population.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeflationStats {
    pub mean_sharpe: f64,
    pub variance: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub n_trials: usize,
    /// Expected maximum annualized Sharpe under the null of no skill.
    pub expected_max_sharpe: f64,
}

/// Statistics over every completed trial with a finite Sharpe ratio.
pub fn population_stats(trials: &[Trial]) -> DeflationStats {
    let sharpes: Vec<f64> = trials
        .iter()
        .filter(|t| t.is_complete())
        .filter_map(|t| t.metric(metric::SHARPE_RATIO))
        .filter(|s| s.is_finite())
        .collect();
    let mean_sharpe = mean(&sharpes);
    let variance = variance(&sharpes);
    DeflationStats {
        mean_sharpe,
        variance,
        skewness: skewness(&sharpes),
        kurtosis: kurtosis(&sharpes),
        n_trials: sharpes.len(),
        expected_max_sharpe: expected_max_sharpe(mean_sharpe, variance, sharpes.len()),
    }
}

/// Expected maximum of `n` draws from a population with the given mean and
/// variance. Falls back to the mean when the spread is undefined.
pub fn expected_max_sharpe(mean: f64, variance: f64, n: usize) -> f64 {
    if n < 2 || !variance.is_finite() || variance <= 0.0 {
        return mean;
    }
    let normal = match Normal::new(0.0, 1.0) {
        Ok(normal) => normal,
        Err(_) => return mean,
    };
    let n = n as f64;
    let z_n = normal.inverse_cdf(1.0 - 1.0 / n);
    let z_ne = normal.inverse_cdf(1.0 - 1.0 / (n * std::f64::consts::E));
    mean + variance.sqrt() * ((1.0 - EULER_GAMMA) * z_n + EULER_GAMMA * z_ne)
}

/// Probability that a per-period Sharpe `sharpe` observed over `n_obs`
/// returns exceeds `reference`, given the returns' skew and (non-excess)
/// kurtosis. NaN when undefined.
pub fn deflated_probability(sharpe: f64, reference: f64, n_obs: usize, skew: f64, kurt: f64) -> f64 {
    if n_obs < 2 || !sharpe.is_finite() || !reference.is_finite() {
        return f64::NAN;
    }
    let denom = 1.0 - skew * sharpe + (kurt - 1.0) / 4.0 * sharpe * sharpe;
    if !(denom > 0.0) {
        return f64::NAN;
    }
    let z = (sharpe - reference) * ((n_obs - 1) as f64).sqrt() / denom.sqrt();
    Normal::new(0.0, 1.0).map(|n| n.cdf(z)).unwrap_or(f64::NAN)
}

pub(crate) fn evaluate(
    config: &DeflationConfig,
    run: &OptimizationRun,
    upstream: &[RankedCandidate],
    top_k: usize,
    backtester: &Backtester,
    period: &Period<'_>,
) -> Vec<Scored> {
    let stats = population_stats(&run.trials);
    let ann = config.annualization_factor.sqrt();
    let reference = stats.expected_max_sharpe / ann;
    debug!(
        "Deflation reference: mean Sharpe {:.3} over {} trials, expected max {:.3}",
        stats.mean_sharpe, stats.n_trials, stats.expected_max_sharpe
    );

    upstream
        .iter()
        .filter_map(|entry| {
            let sharpe = entry.candidate.is_metrics.get(metric::SHARPE_RATIO).copied()?;
            let passes = sharpe.is_finite() && config.min_sharpe.map(|min| sharpe >= min).unwrap_or(true);
            passes.then_some((entry, sharpe))
        })
        .take(top_k)
        .map(|(entry, sharpe)| {
            let (n_obs, skew, kurt) = match backtester.run(period.bars(), &entry.candidate.params, period.warmup()) {
                Ok(backtest) => {
                    let returns = backtest.result.returns();
                    (returns.len(), skewness(&returns), kurtosis(&returns))
                }
                Err(e) => {
                    debug!("Deflation re-run of trial {} failed: {}", entry.candidate.trial_number, e);
                    (0, 0.0, 3.0)
                }
            };
            let probability = deflated_probability(sharpe / ann, reference, n_obs, skew, kurt);
            Scored {
                entry: entry.clone(),
                score: probability,
                metrics: StageMetrics::Deflation {
                    sharpe,
                    probability,
                    expected_max_sharpe: stats.expected_max_sharpe,
                    mean_sharpe: stats.mean_sharpe,
                    n_trials: stats.n_trials,
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Period;
    use crate::objective::ObjectiveEvaluator;
    use crate::postprocess::{fixtures, ChainPeriods, PostProcessChain, PostProcessConfig, StageKind};
    use crate::space::{ObjectiveSpec, ParamSpec, SearchSpace};
    use crate::study::{StopReason, TrialOrigin};
    use crate::types::MetricMap;

    /// 100 trials: 50 around Sharpe 7.45 and 50 around 2.45 (mean 4.95).
    fn population_run() -> OptimizationRun {
        let space = SearchSpace::new(vec![ParamSpec::int("x", 0, 20, 1)])
            .with_objective(ObjectiveSpec::new(metric::SHARPE_RATIO));
        let evaluator = ObjectiveEvaluator::new(&space);
        let trials = (0..100u64)
            .map(|n| {
                let center = if n < 50 { 7.45 } else { 2.45 };
                let offset = if n % 2 == 0 { 0.5 } else { -0.5 };
                let mut metrics = MetricMap::new();
                metrics.insert(metric::SHARPE_RATIO.into(), center + offset);
                metrics.insert(metric::TOTAL_TRADES.into(), 10.0);
                let evaluation = evaluator.evaluate(&metrics);
                Trial::finalize(n, fixtures::params((n % 21) as i64), metrics, evaluation, TrialOrigin::Sampler)
            })
            .collect();
        OptimizationRun::from_trials(space, trials, StopReason::TrialBudget, None)
    }

    #[test]
    fn test_expected_max_grows_with_trials() {
        let few = expected_max_sharpe(1.0, 0.25, 10);
        let many = expected_max_sharpe(1.0, 0.25, 1000);
        assert!(few > 1.0);
        assert!(many > few);
        assert_eq!(expected_max_sharpe(1.0, 0.25, 1), 1.0);
        assert_eq!(expected_max_sharpe(1.0, 0.0, 50), 1.0);
    }

    #[test]
    fn test_deflated_probability() {
        let p_high = deflated_probability(0.2, 0.05, 250, 0.0, 3.0);
        let p_low = deflated_probability(0.0, 0.05, 250, 0.0, 3.0);
        assert!(p_high > 0.95);
        assert!(p_low < 0.5);
        assert!((deflated_probability(0.05, 0.05, 250, 0.0, 3.0) - 0.5).abs() < 1e-9);
        assert!(deflated_probability(0.1, 0.05, 1, 0.0, 3.0).is_nan());
    }

    #[test]
    fn test_population_ignores_failed_and_non_finite() {
        let run = population_run();
        let mut trials = run.trials.clone();
        let mut broken = trials[0].clone();
        broken.number = 500;
        broken.metrics.insert(metric::SHARPE_RATIO.into(), f64::NAN);
        trials.push(broken);
        let stats = population_stats(&trials);
        assert_eq!(stats.n_trials, 100);
    }

    #[test]
    fn test_mean_sharpe_uses_full_population() {
        let run = population_run();
        let bars = fixtures::bars(120);
        let periods = ChainPeriods {
            optimize: Period::new(&bars, 0),
            forward: None,
            oos: None,
        };
        let bt = fixtures::backtester();

        let tight = PostProcessConfig::default()
            .with_top_k(10)
            .with_deflation(DeflationConfig::default().with_min_sharpe(5.0));
        let report = PostProcessChain::new(&tight, &bt).run(&run, &periods).unwrap();
        let stage = report.stage(StageKind::Deflation).unwrap();
        assert_eq!(stage.results.len(), 10);
        for r in &stage.results {
            match &r.metrics {
                StageMetrics::Deflation {
                    mean_sharpe,
                    n_trials,
                    sharpe,
                    ..
                } => {
                    assert!((mean_sharpe - 4.95).abs() < 1e-9);
                    assert_eq!(*n_trials, 100);
                    assert!(*sharpe >= 5.0);
                }
                other => panic!("unexpected metrics {:?}", other),
            }
        }

        let loose = PostProcessConfig::default()
            .with_top_k(10)
            .with_deflation(DeflationConfig::default());
        let loose_report = PostProcessChain::new(&loose, &bt).run(&run, &periods).unwrap();
        let reference = |report: &crate::postprocess::PostProcessReport| match &report
            .stage(StageKind::Deflation)
            .unwrap()
            .results[0]
            .metrics
        {
            StageMetrics::Deflation {
                mean_sharpe,
                expected_max_sharpe,
                ..
            } => (*mean_sharpe, *expected_max_sharpe),
            _ => unreachable!(),
        };
        assert_eq!(reference(&report), reference(&loose_report));
    }
}

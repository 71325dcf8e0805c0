//! Standard performance metrics and the statistics helpers shared by the
//! walk-forward and post-process modules.
//!
//! Ratios that are undefined for the given input are reported as NaN rather
//! than a neutral number, leaving the decision to the objective evaluator:
//!
//! - Sharpe needs at least two returns with non-zero variance.
//! - Sortino is `+inf` when there is no downside and the mean is positive.
//! - Profit factor is `+inf` with wins and no losses, NaN with no trades.
//! - SQN needs at least two trades with non-zero dispersion.

use crate::error::Result;
use crate::simulator::MetricsCalculator;
use crate::space::metric;
use crate::types::{MetricMap, SimulationResult};
use serde::{Deserialize, Serialize};

/// Arithmetic mean, NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n - 1), NaN below two observations.
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Population skewness, 0 for degenerate input.
pub fn skewness(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 3 {
        return 0.0;
    }
    let m = mean(values);
    let m2 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if m2 <= f64::EPSILON {
        return 0.0;
    }
    let m3 = values.iter().map(|v| (v - m).powi(3)).sum::<f64>() / n;
    m3 / m2.powf(1.5)
}

/// Population (non-excess) kurtosis, 3 for degenerate input.
pub fn kurtosis(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 4 {
        return 3.0;
    }
    let m = mean(values);
    let m2 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if m2 <= f64::EPSILON {
        return 3.0;
    }
    let m4 = values.iter().map(|v| (v - m).powi(4)).sum::<f64>() / n;
    m4 / (m2 * m2)
}

/// Per-point drawdown percentages (non-negative) of an equity curve.
pub fn drawdown_series(equity: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    equity
        .iter()
        .map(|&e| {
            peak = peak.max(e);
            if peak > 0.0 {
                (peak - e) / peak * 100.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Maximum peak-to-trough decline in percent.
pub fn max_drawdown_pct(equity: &[f64]) -> f64 {
    drawdown_series(equity).into_iter().fold(0.0, f64::max)
}

/// Per-period Sharpe ratio (not annualized), NaN when undefined.
pub fn sharpe(returns: &[f64]) -> f64 {
    let sd = std_dev(returns);
    if !sd.is_finite() || sd <= f64::EPSILON {
        return f64::NAN;
    }
    mean(returns) / sd
}

fn sortino(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return f64::NAN;
    }
    let m = mean(returns);
    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / returns.len() as f64).sqrt();
    if downside <= f64::EPSILON {
        return if m > 0.0 { f64::INFINITY } else { f64::NAN };
    }
    m / downside
}

/// The metrics calculator used by the CLI and the reference simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardMetrics {
    /// Periods per year used to annualize Sharpe and Sortino.
    pub annualization_factor: f64,
}

impl Default for StandardMetrics {
    fn default() -> Self {
        Self {
            annualization_factor: 252.0,
        }
    }
}

impl StandardMetrics {
    pub fn with_annualization(mut self, factor: f64) -> Self {
        self.annualization_factor = factor;
        self
    }

    /// Compute every standard metric for a simulation.
    pub fn calculate(&self, result: &SimulationResult, initial_balance: f64) -> MetricMap {
        let mut m = MetricMap::new();
        let final_equity = result.equity_curve.last().copied().unwrap_or(initial_balance);
        let net_profit_pct = if initial_balance > 0.0 {
            (final_equity / initial_balance - 1.0) * 100.0
        } else {
            f64::NAN
        };

        let mut curve = Vec::with_capacity(result.equity_curve.len() + 1);
        curve.push(initial_balance);
        curve.extend_from_slice(&result.equity_curve);
        let drawdowns = drawdown_series(&curve);
        let max_dd = drawdowns.iter().copied().fold(0.0, f64::max);
        let ulcer = (drawdowns.iter().map(|d| d * d).sum::<f64>() / drawdowns.len() as f64).sqrt();

        let returns = result.returns();
        let ann = self.annualization_factor.sqrt();

        let trade_returns: Vec<f64> = result.trades.iter().map(|t| t.return_pct()).collect();
        let pnls: Vec<f64> = result.trades.iter().map(|t| t.net_pnl()).collect();
        let gross_win: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = -pnls.iter().filter(|p| **p < 0.0).sum::<f64>();
        let wins = pnls.iter().filter(|p| **p > 0.0).count();

        let profit_factor = if pnls.is_empty() {
            f64::NAN
        } else if gross_loss <= f64::EPSILON {
            if gross_win > 0.0 {
                f64::INFINITY
            } else {
                f64::NAN
            }
        } else {
            gross_win / gross_loss
        };

        let sqn = {
            let sd = std_dev(&trade_returns);
            if trade_returns.len() < 2 || !sd.is_finite() || sd <= f64::EPSILON {
                f64::NAN
            } else {
                (trade_returns.len() as f64).sqrt() * mean(&trade_returns) / sd
            }
        };

        let romad = if max_dd > f64::EPSILON {
            net_profit_pct / max_dd
        } else {
            f64::NAN
        };

        m.insert(metric::NET_PROFIT_PCT.into(), net_profit_pct);
        m.insert(metric::MAX_DRAWDOWN_PCT.into(), max_dd);
        m.insert(metric::TOTAL_TRADES.into(), result.trades.len() as f64);
        m.insert(
            metric::WIN_RATE.into(),
            if pnls.is_empty() {
                0.0
            } else {
                wins as f64 / pnls.len() as f64 * 100.0
            },
        );
        m.insert(metric::SHARPE_RATIO.into(), sharpe(&returns) * ann);
        m.insert(metric::SORTINO_RATIO.into(), sortino(&returns) * ann);
        m.insert(metric::PROFIT_FACTOR.into(), profit_factor);
        m.insert(metric::SQN.into(), sqn);
        m.insert(metric::ROMAD.into(), romad);
        m.insert(metric::ULCER_INDEX.into(), ulcer);
        m.insert(
            metric::AVG_TRADE_PCT.into(),
            if trade_returns.is_empty() { 0.0 } else { mean(&trade_returns) },
        );
        m
    }
}

impl MetricsCalculator for StandardMetrics {
    fn compute(&self, result: &SimulationResult, initial_balance: f64) -> Result<MetricMap> {
        Ok(self.calculate(result, initial_balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Trade};
    use chrono::{Duration, TimeZone, Utc};

    fn trade(entry: f64, exit: f64) -> Trade {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Trade {
            side: Side::Buy,
            quantity: 10.0,
            entry_price: entry,
            entry_time: t0,
            entry_index: 0,
            exit_price: exit,
            exit_time: t0 + Duration::days(1),
            exit_index: 1,
            commission: 0.0,
        }
    }

    #[test]
    fn test_moments() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((mean(&v) - 2.5).abs() < 1e-12);
        assert!((variance(&v) - 5.0 / 3.0).abs() < 1e-12);
        assert!(skewness(&v).abs() < 1e-12);
        assert!(mean(&[]).is_nan());
        assert!(variance(&[1.0]).is_nan());
    }

    #[test]
    fn test_max_drawdown() {
        let equity = [100.0, 120.0, 90.0, 130.0, 117.0];
        assert!((max_drawdown_pct(&equity) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_trades_gives_undefined_ratios() {
        let result = SimulationResult {
            equity_curve: vec![1000.0; 10],
            balance_curve: vec![1000.0; 10],
            ..Default::default()
        };
        let m = StandardMetrics::default().calculate(&result, 1000.0);
        assert_eq!(m[metric::TOTAL_TRADES], 0.0);
        assert_eq!(m[metric::NET_PROFIT_PCT], 0.0);
        assert!(m[metric::SHARPE_RATIO].is_nan());
        assert!(m[metric::PROFIT_FACTOR].is_nan());
        assert!(m[metric::SQN].is_nan());
        assert_eq!(m[metric::MAX_DRAWDOWN_PCT], 0.0);
    }

    #[test]
    fn test_all_winners_profit_factor_infinite() {
        let result = SimulationResult {
            trades: vec![trade(100.0, 110.0), trade(100.0, 105.0)],
            equity_curve: vec![1000.0, 1100.0, 1150.0],
            balance_curve: vec![1000.0, 1100.0, 1150.0],
            ..Default::default()
        };
        let m = StandardMetrics::default().calculate(&result, 1000.0);
        assert!(m[metric::PROFIT_FACTOR].is_infinite());
        assert_eq!(m[metric::WIN_RATE], 100.0);
        assert!((m[metric::NET_PROFIT_PCT] - 15.0).abs() < 1e-9);
        assert!(m[metric::SQN].is_finite());
    }

    #[test]
    fn test_mixed_trades() {
        let result = SimulationResult {
            trades: vec![trade(100.0, 110.0), trade(100.0, 95.0)],
            equity_curve: vec![1000.0, 1100.0, 1050.0],
            balance_curve: vec![1000.0, 1100.0, 1050.0],
            ..Default::default()
        };
        let m = StandardMetrics::default().calculate(&result, 1000.0);
        assert!((m[metric::PROFIT_FACTOR] - 2.0).abs() < 1e-12);
        assert!((m[metric::WIN_RATE] - 50.0).abs() < 1e-12);
        let dd = (1100.0 - 1050.0) / 1100.0 * 100.0;
        assert!((m[metric::MAX_DRAWDOWN_PCT] - dd).abs() < 1e-9);
        assert!((m[metric::ROMAD] - 5.0 / dd).abs() < 1e-9);
    }
}

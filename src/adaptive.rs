//! Adaptive out-of-sample length.
//!
//! An adaptive window keeps extending its OOS segment bar by bar while the
//! selected parameters behave like they did in sample, and closes it at the
//! first bar where any trigger fires:
//!
//! - **CUSUM**: standardized downside drift of returns against the IS
//!   return distribution, `s_t = max(0, s_{t-1} + (mu_IS - r_t) / sigma_IS - k)`,
//!   fires when `s_t > h`.
//! - **Drawdown**: OOS drawdown exceeds `drawdown_mult` times the IS maximum.
//! - **Inactivity**: bars without a trade entry or exit exceed
//!   `inactivity_mult` times the IS bars-per-trade.
//!
//! Until `min_oos_trades` trades have closed, triggers are ignored. Without
//! a trigger the segment runs to `max_oos_days` or the end of the data.

use crate::analytics::{max_drawdown_pct, mean, std_dev};
use crate::error::{OptimizeError, Result};
use crate::types::SimulationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trigger thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// CUSUM drift allowance in IS standard deviations.
    pub cusum_k: f64,
    /// CUSUM decision threshold.
    pub cusum_h: f64,
    pub drawdown_mult: f64,
    pub inactivity_mult: f64,
    pub max_oos_days: u32,
    pub min_oos_trades: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            cusum_k: 0.5,
            cusum_h: 5.0,
            drawdown_mult: 1.5,
            inactivity_mult: 3.0,
            max_oos_days: 90,
            min_oos_trades: 0,
        }
    }
}

impl AdaptiveConfig {
    pub fn with_max_oos_days(mut self, days: u32) -> Self {
        self.max_oos_days = days;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("cusum_h", self.cusum_h),
            ("drawdown_mult", self.drawdown_mult),
            ("inactivity_mult", self.inactivity_mult),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(OptimizeError::ConfigError(format!(
                    "adaptive {} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.cusum_k >= 0.0) {
            return Err(OptimizeError::ConfigError(
                "adaptive cusum_k must not be negative".to_string(),
            ));
        }
        if self.max_oos_days == 0 {
            return Err(OptimizeError::ConfigError(
                "adaptive max_oos_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why an OOS segment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Cusum,
    Drawdown,
    Inactivity,
    /// The segment reached the maximum OOS length.
    MaxLength,
    /// The data ran out before the maximum length.
    EndOfData,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::Cusum => "cusum",
            Trigger::Drawdown => "drawdown",
            Trigger::Inactivity => "inactivity",
            Trigger::MaxLength => "max_length",
            Trigger::EndOfData => "end_of_data",
        };
        write!(f, "{}", s)
    }
}

/// In-sample behaviour of the selected parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean_return: f64,
    pub std_return: f64,
    pub max_drawdown_pct: f64,
    /// Evaluated bars per trade, `None` without trades.
    pub bars_per_trade: Option<f64>,
}

impl Baseline {
    pub fn from_result(result: &SimulationResult) -> Self {
        let returns = result.returns();
        let bars_per_trade = if result.trades.is_empty() {
            None
        } else {
            Some(result.len() as f64 / result.trades.len() as f64)
        };
        Self {
            mean_return: mean(&returns),
            std_return: std_dev(&returns),
            max_drawdown_pct: max_drawdown_pct(&result.equity_curve),
            bars_per_trade,
        }
    }
}

/// Where the scan closed the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Offset of the closing point in the scanned curve; the segment is
    /// degenerate when it is 0.
    pub end: usize,
    pub trigger: Trigger,
}

/// Position in `timestamps` of each trade entry and exit.
fn activity_marks(result: &SimulationResult) -> (Vec<bool>, Vec<usize>) {
    let n = result.len();
    let mut active = vec![false; n];
    let mut closed_at = vec![0usize; n];
    if result.timestamps.len() != n {
        return (active, closed_at);
    }
    let position = |ts: DateTime<Utc>| result.timestamps.partition_point(|t| *t < ts);
    for trade in &result.trades {
        for ts in [trade.entry_time, trade.exit_time] {
            let i = position(ts);
            if i < n {
                active[i] = true;
            }
        }
        let i = position(trade.exit_time);
        if i < n {
            closed_at[i] += 1;
        }
    }
    (active, closed_at)
}

/// Scan a simulation over the longest allowed OOS segment. `reached_cap`
/// tells whether that segment was cut by the maximum length rather than by
/// the end of the data.
pub fn scan(config: &AdaptiveConfig, baseline: &Baseline, oos: &SimulationResult, reached_cap: bool) -> ScanOutcome {
    let equity = &oos.equity_curve;
    let n = equity.len();
    let (active, closed_at) = activity_marks(oos);

    let cusum_enabled = baseline.std_return.is_finite() && baseline.std_return > 0.0 && baseline.mean_return.is_finite();
    let dd_limit = if baseline.max_drawdown_pct > 0.0 {
        Some(baseline.max_drawdown_pct * config.drawdown_mult)
    } else {
        None
    };
    let idle_limit = baseline.bars_per_trade.map(|b| b * config.inactivity_mult);

    let mut cusum = 0.0;
    let mut peak = equity.first().copied().unwrap_or(0.0);
    let mut last_active = 0usize;
    let mut closed = closed_at.first().copied().unwrap_or(0);

    for t in 1..n {
        let prev = equity[t - 1];
        let r = if prev.abs() > f64::EPSILON { equity[t] / prev - 1.0 } else { 0.0 };
        if active[t] {
            last_active = t;
        }
        closed += closed_at[t];
        peak = peak.max(equity[t]);

        let cusum_fired = cusum_enabled && {
            cusum = f64::max(0.0, cusum + (baseline.mean_return - r) / baseline.std_return - config.cusum_k);
            cusum > config.cusum_h
        };
        let drawdown = if peak > 0.0 { (peak - equity[t]) / peak * 100.0 } else { 0.0 };
        let dd_fired = dd_limit.map(|limit| drawdown > limit).unwrap_or(false);
        let idle_fired = idle_limit.map(|limit| (t - last_active) as f64 > limit).unwrap_or(false);

        if closed < config.min_oos_trades {
            continue;
        }
        let trigger = if cusum_fired {
            Some(Trigger::Cusum)
        } else if dd_fired {
            Some(Trigger::Drawdown)
        } else if idle_fired {
            Some(Trigger::Inactivity)
        } else {
            None
        };
        if let Some(trigger) = trigger {
            return ScanOutcome { end: t, trigger };
        }
    }

    ScanOutcome {
        end: n.saturating_sub(1),
        trigger: if reached_cap { Trigger::MaxLength } else { Trigger::EndOfData },
    }
}

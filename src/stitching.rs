//! Stitching per-window OOS equity into one continuous series.
//!
//! Each segment is rescaled so that it starts where the previous one ended,
//! turning the windows into one compounded timeline. Consecutive windows
//! share their boundary bar; the duplicated point is only kept once.
//! Segments without at least one return are never appended.

use crate::analytics::max_drawdown_pct;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Concatenated OOS equity with window boundary markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchedSeries {
    pub initial_equity: f64,
    pub equity: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
    /// Index into `equity` of the first point contributed by each window.
    pub boundaries: Vec<usize>,
    /// Window index of each boundary.
    pub windows: Vec<usize>,
}

impl StitchedSeries {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            initial_equity,
            equity: Vec::new(),
            timestamps: Vec::new(),
            boundaries: Vec::new(),
            windows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.equity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.equity.is_empty()
    }

    pub fn final_equity(&self) -> f64 {
        self.equity.last().copied().unwrap_or(self.initial_equity)
    }

    /// Append one window's OOS equity. Returns whether anything was added.
    pub fn append(&mut self, window: usize, equity: &[f64], timestamps: &[DateTime<Utc>]) -> bool {
        if equity.len() < 2 {
            debug!("Window {} has a zero-length OOS segment, not stitched", window);
            return false;
        }
        if timestamps.len() != equity.len() {
            warn!(
                "Window {} OOS segment has {} points but {} timestamps, not stitched",
                window,
                equity.len(),
                timestamps.len()
            );
            return false;
        }
        let base = equity[0];
        if !(base.abs() > f64::EPSILON) || !base.is_finite() {
            warn!("Window {} OOS segment starts at {}, not stitched", window, base);
            return false;
        }

        let skip_first = self.timestamps.last().map(|t| *t == timestamps[0]).unwrap_or(false);
        let start = if skip_first { 1 } else { 0 };
        if let Some(last) = self.timestamps.last() {
            if timestamps[start] <= *last {
                warn!("Window {} OOS segment overlaps the stitched series, not stitched", window);
                return false;
            }
        }

        let scale = self.final_equity() / base;
        self.boundaries.push(self.equity.len());
        self.windows.push(window);
        self.equity.extend(equity[start..].iter().map(|e| e * scale));
        self.timestamps.extend_from_slice(&timestamps[start..]);
        true
    }

    pub fn total_return_pct(&self) -> f64 {
        if self.initial_equity.abs() > f64::EPSILON {
            (self.final_equity() / self.initial_equity - 1.0) * 100.0
        } else {
            f64::NAN
        }
    }

    pub fn max_drawdown_pct(&self) -> f64 {
        max_drawdown_pct(&self.equity)
    }
}

/// Per-window figures feeding the summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowFigures {
    pub is_return_pct: f64,
    pub is_days: f64,
    pub oos_return_pct: f64,
    pub oos_days: f64,
}

/// Portfolio-level statistics of a walk-forward run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StitchedSummary {
    pub windows: usize,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub profitable_window_ratio: f64,
    pub mean_oos_return_pct: f64,
    /// OOS net profit per day over IS net profit per day.
    pub walk_forward_efficiency: f64,
}

pub fn summarize(series: &StitchedSeries, windows: &[WindowFigures]) -> StitchedSummary {
    let n = windows.len();
    let profitable = windows.iter().filter(|w| w.oos_return_pct > 0.0).count();
    let oos_sum: f64 = windows.iter().map(|w| w.oos_return_pct).sum();
    let oos_days: f64 = windows.iter().map(|w| w.oos_days).sum();
    let is_sum: f64 = windows.iter().map(|w| w.is_return_pct).sum();
    let is_days: f64 = windows.iter().map(|w| w.is_days).sum();

    let walk_forward_efficiency = if oos_days > 0.0 && is_days > 0.0 && is_sum.abs() > f64::EPSILON {
        (oos_sum / oos_days) / (is_sum / is_days)
    } else {
        f64::NAN
    };

    StitchedSummary {
        windows: n,
        total_return_pct: if series.is_empty() { 0.0 } else { series.total_return_pct() },
        max_drawdown_pct: series.max_drawdown_pct(),
        profitable_window_ratio: if n == 0 { f64::NAN } else { profitable as f64 / n as f64 },
        mean_oos_return_pct: if n == 0 { f64::NAN } else { oos_sum / n as f64 },
        walk_forward_efficiency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn days(from: i64, n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| start + Duration::days(from + i as i64)).collect()
    }

    #[test]
    fn test_chain_scaling_and_shared_boundary() {
        let mut series = StitchedSeries::new(100.0);
        assert!(series.append(0, &[1000.0, 1100.0, 1210.0], &days(0, 3)));
        // Starts on the previous segment's last bar.
        assert!(series.append(1, &[500.0, 450.0], &days(2, 2)));

        assert_eq!(series.len(), 4);
        assert_eq!(series.boundaries, vec![0, 3]);
        assert_eq!(series.windows, vec![0, 1]);
        assert!((series.equity[2] - 121.0).abs() < 1e-9);
        assert!((series.equity[3] - 108.9).abs() < 1e-9);
        assert!((series.total_return_pct() - 8.9).abs() < 1e-9);
        assert!(series.timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_zero_length_segment_never_appended() {
        let mut series = StitchedSeries::new(100.0);
        assert!(!series.append(0, &[1000.0], &days(0, 1)));
        assert!(!series.append(1, &[], &[]));
        assert!(series.is_empty());
        assert!(series.boundaries.is_empty());
    }

    #[test]
    fn test_overlapping_segment_rejected() {
        let mut series = StitchedSeries::new(100.0);
        assert!(series.append(0, &[1.0, 2.0, 3.0], &days(0, 3)));
        assert!(!series.append(1, &[1.0, 2.0, 3.0], &days(0, 3)));
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn test_summary() {
        let mut series = StitchedSeries::new(100.0);
        series.append(0, &[1000.0, 1100.0], &days(0, 2));
        series.append(1, &[1000.0, 950.0], &days(1, 2));
        let figures = [
            WindowFigures {
                is_return_pct: 20.0,
                is_days: 100.0,
                oos_return_pct: 10.0,
                oos_days: 50.0,
            },
            WindowFigures {
                is_return_pct: 20.0,
                is_days: 100.0,
                oos_return_pct: -5.0,
                oos_days: 50.0,
            },
        ];
        let summary = summarize(&series, &figures);
        assert_eq!(summary.windows, 2);
        assert_eq!(summary.profitable_window_ratio, 0.5);
        assert!((summary.mean_oos_return_pct - 2.5).abs() < 1e-12);
        assert!((summary.walk_forward_efficiency - 0.25).abs() < 1e-12);
        assert!((summary.total_return_pct - 4.5).abs() < 1e-9);
        assert!((summary.max_drawdown_pct - 5.0).abs() < 1e-9);
    }
}

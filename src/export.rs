//! Export utilities for optimization and walk-forward results.
//!
//! | Record | Format | Contents |
//! |--------|--------|----------|
//! | [`RunRecord`] | JSON | one optimization run, its trials and post-process report |
//! | [`TrialRecord`] | JSON / CSV | one trial with rank, Pareto and feasibility flags |
//! | [`WalkForwardRecord`] | JSON | windows ([`WindowRecord`]) plus the stitched series ([`StitchedRecord`]) |
//!
//! Every run record carries a [`RunMetadata`] fingerprint.

use crate::error::Result;
use crate::metadata::RunMetadata;
use crate::objective::FailureReason;
use crate::postprocess::{PostProcessReport, SkippedStage, StageKind, StageResult};
use crate::space::ParamSet;
use crate::stitching::{StitchedSeries, StitchedSummary};
use crate::study::{OptimizationRun, StopReason, Trial, TrialOrigin, TrialState};
use crate::types::MetricMap;
use crate::walkforward::{WalkForwardResult, Window, WindowTrigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

/// One trial as exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number: u64,
    pub state: TrialState,
    pub origin: TrialOrigin,
    /// 1-based position in the run's ranking.
    pub rank: Option<usize>,
    pub feasible: bool,
    pub pareto: bool,
    pub params: ParamSet,
    pub values: Option<Vec<f64>>,
    pub constraint_violations: Option<Vec<f64>>,
    #[serde(with = "crate::types::metric_map_serde")]
    pub metrics: MetricMap,
    pub sanitized_metrics: Vec<String>,
    pub failure: Option<FailureReason>,
}

impl TrialRecord {
    pub fn from_trial(run: &OptimizationRun, trial: &Trial) -> Self {
        Self {
            number: trial.number,
            state: trial.state,
            origin: trial.origin,
            rank: run.ranked.iter().position(|n| *n == trial.number).map(|i| i + 1),
            feasible: trial.is_feasible(),
            pareto: run.is_pareto(trial.number),
            params: trial.params.clone(),
            values: trial.values.clone(),
            constraint_violations: trial.constraint_violations.clone(),
            metrics: trial.metrics.clone(),
            sanitized_metrics: trial.sanitized_metrics.clone(),
            failure: trial.failure.clone(),
        }
    }
}

/// Records of every trial, best ranked first and unranked trials last.
pub fn trial_records(run: &OptimizationRun) -> Vec<TrialRecord> {
    let mut records: Vec<TrialRecord> = run.trials.iter().map(|t| TrialRecord::from_trial(run, t)).collect();
    records.sort_by_key(|r| (r.rank.unwrap_or(usize::MAX), r.number));
    records
}

/// A complete standalone optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub metadata: RunMetadata,
    pub stop_reason: StopReason,
    pub cancelled: bool,
    pub coverage_advisory: Option<String>,
    pub best_trial: Option<u64>,
    pub trials: Vec<TrialRecord>,
    pub postprocess: Option<PostProcessReport>,
}

impl RunRecord {
    pub fn new(metadata: RunMetadata, run: &OptimizationRun, postprocess: Option<&PostProcessReport>) -> Self {
        Self {
            metadata,
            stop_reason: run.stop_reason,
            cancelled: run.cancelled,
            coverage_advisory: run.coverage_advisory.clone(),
            best_trial: run.best_trial,
            trials: trial_records(run),
            postprocess: postprocess.cloned(),
        }
    }
}

/// One walk-forward window as exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub index: usize,
    pub trigger: WindowTrigger,
    pub is_start: DateTime<Utc>,
    pub is_end: DateTime<Utc>,
    pub optimize_end: DateTime<Utc>,
    pub oos_start: DateTime<Utc>,
    pub oos_end: DateTime<Utc>,
    pub n_trials: usize,
    pub selected_trial: u64,
    pub selected_params: ParamSet,
    /// Stage whose ranking picked the parameters.
    pub selected_by: StageKind,
    #[serde(with = "crate::types::metric_map_serde")]
    pub is_metrics: MetricMap,
    #[serde(with = "crate::types::metric_map_serde")]
    pub oos_metrics: MetricMap,
    pub stages: Vec<StageResult>,
    pub skipped: Vec<SkippedStage>,
}

impl From<&Window> for WindowRecord {
    fn from(w: &Window) -> Self {
        Self {
            index: w.index,
            trigger: w.trigger,
            is_start: w.is_start,
            is_end: w.is_end,
            optimize_end: w.optimize_end,
            oos_start: w.oos_start,
            oos_end: w.oos_end,
            n_trials: w.run.trials.len(),
            selected_trial: w.selected_trial,
            selected_params: w.selected_params.clone(),
            selected_by: w.postprocess.final_source,
            is_metrics: w.is_metrics.clone(),
            oos_metrics: w.oos_metrics.clone(),
            stages: w.postprocess.stages.clone(),
            skipped: w.postprocess.skipped.clone(),
        }
    }
}

/// One point of the stitched OOS curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StitchedPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub window: usize,
}

/// The stitched OOS curve and its statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchedRecord {
    pub initial_equity: f64,
    pub summary: StitchedSummary,
    pub points: Vec<StitchedPoint>,
}

impl StitchedRecord {
    pub fn new(series: &StitchedSeries, summary: StitchedSummary) -> Self {
        let mut points = Vec::with_capacity(series.len());
        for (i, (&equity, &timestamp)) in series.equity.iter().zip(&series.timestamps).enumerate() {
            let segment = series.boundaries.partition_point(|&b| b <= i).saturating_sub(1);
            points.push(StitchedPoint {
                timestamp,
                equity,
                window: series.windows.get(segment).copied().unwrap_or(0),
            });
        }
        Self {
            initial_equity: series.initial_equity,
            summary,
            points,
        }
    }
}

/// A complete walk-forward run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardRecord {
    pub metadata: RunMetadata,
    pub dropped_windows: usize,
    pub windows: Vec<WindowRecord>,
    pub stitched: StitchedRecord,
}

impl WalkForwardRecord {
    pub fn new(metadata: RunMetadata, result: &WalkForwardResult) -> Self {
        Self {
            metadata,
            dropped_windows: result.dropped_windows,
            windows: result.windows.iter().map(WindowRecord::from).collect(),
            stitched: StitchedRecord::new(&result.stitched, result.summary),
        }
    }
}

/// Write any record as pretty JSON.
pub fn export_json<T: Serialize>(record: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, record)?;
    info!("Wrote {}", path.display());
    Ok(())
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        format!("{}", v)
    }
}

/// Trial table as CSV: one row per trial, one column per parameter, objective
/// value and metric.
pub fn trials_to_csv<W: std::io::Write>(run: &OptimizationRun, writer: W) -> Result<()> {
    let param_names: Vec<&str> = run.space.params.iter().map(|p| p.name.as_str()).collect();
    let objective_names: Vec<String> = run.space.objectives.iter().map(|o| format!("value_{}", o.metric)).collect();
    let metric_names: BTreeSet<&str> = run
        .trials
        .iter()
        .flat_map(|t| t.metrics.keys().map(String::as_str))
        .collect();

    let mut csv = csv::Writer::from_writer(writer);
    let mut header: Vec<String> = ["number", "state", "origin", "rank", "feasible", "pareto"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(param_names.iter().map(|s| s.to_string()));
    header.extend(objective_names.iter().cloned());
    header.extend(metric_names.iter().map(|s| s.to_string()));
    csv.write_record(&header)?;

    for record in trial_records(run) {
        let mut row = vec![
            record.number.to_string(),
            format!("{:?}", record.state).to_lowercase(),
            format!("{:?}", record.origin).to_lowercase(),
            record.rank.map(|r| r.to_string()).unwrap_or_default(),
            record.feasible.to_string(),
            record.pareto.to_string(),
        ];
        row.extend(
            param_names
                .iter()
                .map(|name| record.params.get(*name).map(|v| v.to_string()).unwrap_or_default()),
        );
        row.extend((0..objective_names.len()).map(|i| {
            record
                .values
                .as_ref()
                .and_then(|v| v.get(i))
                .map(|v| format_value(*v))
                .unwrap_or_default()
        }));
        row.extend(
            metric_names
                .iter()
                .map(|name| record.metrics.get(*name).map(|v| format_value(*v)).unwrap_or_default()),
        );
        csv.write_record(&row)?;
    }
    csv.flush()?;
    Ok(())
}

/// Export the trial table to a CSV file.
pub fn export_trials_csv(run: &OptimizationRun, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    trials_to_csv(run, File::create(path)?)?;
    info!("Wrote {} trials to {}", run.trials.len(), path.display());
    Ok(())
}

/// Export the stitched OOS curve to CSV.
pub fn export_stitched_csv(record: &StitchedRecord, path: impl AsRef<Path>) -> Result<()> {
    let mut csv = csv::Writer::from_path(path.as_ref())?;
    for point in &record.points {
        csv.serialize(point)?;
    }
    csv.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Period;
    use crate::postprocess::fixtures;
    use crate::space::metric;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn run() -> OptimizationRun {
        let bars = fixtures::bars(60);
        fixtures::run(&Period::new(&bars, 0))
    }

    #[test]
    fn test_trial_records_follow_ranking() {
        let run = run();
        let records = trial_records(&run);
        assert_eq!(records.len(), 21);
        assert_eq!(records[0].rank, Some(1));
        assert_eq!(Some(records[0].number), run.best_trial);
        assert!(records.windows(2).all(|w| w[0].rank <= w[1].rank));
    }

    #[test]
    fn test_trials_csv_columns() {
        let run = run();
        let mut buf = Vec::new();
        trials_to_csv(&run, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("number,state,origin,rank,feasible,pareto,x,value_net_profit_pct"));
        assert!(header.contains(metric::SHARPE_RATIO));
        assert_eq!(lines.count(), 21);
    }

    #[test]
    fn test_run_record_json_roundtrip() {
        let run = run();
        let bars = fixtures::bars(60);
        let metadata = RunMetadata::new(Uuid::new_v4(), &run.space, &bars);
        let record = RunRecord::new(metadata, &run, None);

        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        export_json(&record, &path).unwrap();
        let loaded: RunRecord = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded.trials.len(), 21);
        assert_eq!(loaded.best_trial, run.best_trial);
        assert_eq!(loaded.metadata.config_hash, record.metadata.config_hash);
    }

    #[test]
    fn test_stitched_points_carry_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ts: Vec<_> = (0..5).map(|i| start + Duration::days(i)).collect();
        let mut series = StitchedSeries::new(100.0);
        series.append(3, &[100.0, 101.0, 102.0], &ts[0..3]);
        series.append(4, &[100.0, 99.0, 98.0], &ts[2..5]);
        let summary = crate::stitching::summarize(&series, &[]);
        let record = StitchedRecord::new(&series, summary);

        let windows: Vec<usize> = record.points.iter().map(|p| p.window).collect();
        assert_eq!(windows, vec![3, 3, 3, 4, 4]);

        let dir = tempdir().unwrap();
        let path = dir.path().join("stitched.csv");
        export_stitched_csv(&record, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("timestamp,equity,window"));
        assert_eq!(text.lines().count(), 6);
    }
}

//! Trials and the optimization run that owns them.

use crate::objective::{Evaluation, FailureReason};
use crate::space::{format_params, ParamSet, SearchSpace};
use crate::types::MetricMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal state of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialState {
    Complete,
    Failed,
}

/// Where a trial's parameters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialOrigin {
    Coverage,
    Sampler,
}

/// One finalized evaluation of a parameter assignment.
///
/// Trials are created when a point is proposed or enqueued and finalized
/// exactly once; nothing mutates them afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: u64,
    pub params: ParamSet,
    /// Raw metrics as reported by the metrics calculator.
    #[serde(with = "crate::types::metric_map_serde")]
    pub metrics: MetricMap,
    pub values: Option<Vec<f64>>,
    pub constraint_violations: Option<Vec<f64>>,
    pub state: TrialState,
    #[serde(default)]
    pub sanitized_metrics: Vec<String>,
    pub origin: TrialOrigin,
    #[serde(default)]
    pub failure: Option<FailureReason>,
}

impl Trial {
    /// Finalize a trial from its evaluation.
    pub fn finalize(
        number: u64,
        params: ParamSet,
        metrics: MetricMap,
        evaluation: Evaluation,
        origin: TrialOrigin,
    ) -> Self {
        let state = if evaluation.values.is_some() {
            TrialState::Complete
        } else {
            TrialState::Failed
        };
        Self {
            number,
            params,
            metrics,
            values: evaluation.values,
            constraint_violations: evaluation.constraint_violations,
            state,
            sanitized_metrics: evaluation.sanitized,
            origin,
            failure: evaluation.failure,
        }
    }

    /// A trial whose simulator or metrics collaborator failed.
    pub fn collaborator_failure(number: u64, params: ParamSet, message: String, origin: TrialOrigin) -> Self {
        Self {
            number,
            params,
            metrics: MetricMap::new(),
            values: None,
            constraint_violations: None,
            state: TrialState::Failed,
            sanitized_metrics: Vec::new(),
            origin,
            failure: Some(FailureReason::Collaborator { message }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == TrialState::Complete
    }

    /// Complete with every constraint satisfied.
    pub fn is_feasible(&self) -> bool {
        self.is_complete()
            && self
                .constraint_violations
                .as_ref()
                .map(|v| v.iter().all(|x| *x <= 0.0))
                .unwrap_or(true)
    }

    /// Sum of positive violations, used to order infeasible trials.
    pub fn total_violation(&self) -> f64 {
        self.constraint_violations
            .as_ref()
            .map(|v| v.iter().filter(|x| **x > 0.0).sum())
            .unwrap_or(f64::INFINITY)
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.as_ref().and_then(|v| v.get(index).copied())
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn is_sanitized(&self) -> bool {
        !self.sanitized_metrics.is_empty()
    }
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.values {
            Some(values) => write!(
                f,
                "#{} [{}] -> {:?}{}",
                self.number,
                format_params(&self.params),
                values,
                if self.is_feasible() { "" } else { " (infeasible)" }
            ),
            None => write!(f, "#{} [{}] -> failed", self.number, format_params(&self.params)),
        }
    }
}

/// Why an orchestrator stopped issuing trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TrialBudget,
    TimeBudget,
    Stagnation,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::TrialBudget => "trial budget reached",
            StopReason::TimeBudget => "time budget reached",
            StopReason::Stagnation => "no improvement within stagnation budget",
            StopReason::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Complete record of one optimization run.
///
/// Built by the orchestrator and read-only everywhere downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRun {
    pub space: SearchSpace,
    /// All finalized trials ordered by trial number.
    pub trials: Vec<Trial>,
    /// Trial numbers of feasible completed trials.
    pub feasible: Vec<u64>,
    /// Trial numbers of the feasible Pareto front.
    pub pareto: Vec<u64>,
    /// Completed trial numbers in ranked order.
    pub ranked: Vec<u64>,
    pub best_trial: Option<u64>,
    pub stop_reason: StopReason,
    pub coverage_advisory: Option<String>,
    pub cancelled: bool,
}

impl OptimizationRun {
    /// Assemble a run from finalized trials, ranking them.
    pub fn from_trials(
        space: SearchSpace,
        mut trials: Vec<Trial>,
        stop_reason: StopReason,
        coverage_advisory: Option<String>,
    ) -> Self {
        trials.sort_by_key(|t| t.number);
        let feasible = trials.iter().filter(|t| t.is_feasible()).map(|t| t.number).collect();
        let pareto = crate::ranking::pareto_front(&space, &trials);
        let ranked = crate::ranking::rank_trials(&space, &trials);
        let best_trial = ranked.first().copied();
        Self {
            space,
            trials,
            feasible,
            pareto,
            ranked,
            best_trial,
            stop_reason,
            coverage_advisory,
            cancelled: stop_reason == StopReason::Cancelled,
        }
    }

    pub fn trial(&self, number: u64) -> Option<&Trial> {
        self.trials
            .binary_search_by_key(&number, |t| t.number)
            .ok()
            .map(|i| &self.trials[i])
    }

    pub fn best(&self) -> Option<&Trial> {
        self.best_trial.and_then(|n| self.trial(n))
    }

    /// Completed trials in ranked order.
    pub fn ranked_trials(&self) -> Vec<&Trial> {
        self.ranked.iter().filter_map(|n| self.trial(*n)).collect()
    }

    pub fn completed_count(&self) -> usize {
        self.trials.iter().filter(|t| t.is_complete()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.trials.len() - self.completed_count()
    }

    pub fn is_pareto(&self, number: u64) -> bool {
        self.pareto.contains(&number)
    }

    pub fn is_feasible(&self, number: u64) -> bool {
        self.feasible.contains(&number)
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} trials ({} complete, {} failed, {} feasible, {} Pareto), stopped: {}",
            self.trials.len(),
            self.completed_count(),
            self.failed_count(),
            self.feasible.len(),
            self.pareto.len(),
            self.stop_reason
        )
    }
}

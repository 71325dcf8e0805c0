//! Objective and constraint evaluation of raw trial metrics.
//!
//! Rules are applied in a fixed order:
//!
//! 1. An infinite `profit_factor` objective fails the trial outright.
//! 2. The sanitization gate opens only when sanitization is enabled and the
//!    trade count is finite and at most the configured threshold.
//! 3. With the gate open, non-finite `sharpe_ratio`, `sortino_ratio` and `sqn`
//!    become 0.0; a missing or NaN `profit_factor` becomes 0.0.
//! 4. Any objective still non-finite fails the trial (all values undefined).
//! 5. Constraints are evaluated from the raw metrics, never from sanitized
//!    objective values. A missing or non-finite constraint metric counts as a
//!    fixed, large violation.

use crate::space::{metric, ConstraintOp, ConstraintSpec, ObjectiveSpec, SanitizeConfig, SearchSpace};
use crate::types::MetricMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Violation recorded for a constraint whose metric is missing or non-finite.
pub const MISSING_CONSTRAINT_VIOLATION: f64 = 1.0e6;

/// Metrics replaced with 0.0 on any non-finite value when the gate is open.
const SANITIZE_ANY_NON_FINITE: [&str; 3] = [metric::SHARPE_RATIO, metric::SORTINO_RATIO, metric::SQN];

/// Why a trial failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    InfiniteProfitFactor,
    NonFiniteObjective { metric: String },
    Collaborator { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::InfiniteProfitFactor => write!(f, "profit factor objective is infinite"),
            FailureReason::NonFiniteObjective { metric } => {
                write!(f, "objective '{}' is not finite after sanitization", metric)
            }
            FailureReason::Collaborator { message } => write!(f, "{}", message),
        }
    }
}

/// Outcome of evaluating one trial's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Objective vector, `None` when the trial failed.
    pub values: Option<Vec<f64>>,
    /// One entry per enabled constraint; omitted when the trial failed.
    pub constraint_violations: Option<Vec<f64>>,
    /// Metrics replaced by sanitization.
    pub sanitized: Vec<String>,
    pub failure: Option<FailureReason>,
}

impl Evaluation {
    /// A failed evaluation with no objective values and no constraint vector.
    pub fn failed(reason: FailureReason) -> Self {
        Self {
            values: None,
            constraint_violations: None,
            sanitized: Vec::new(),
            failure: Some(reason),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.values.is_none()
    }

    /// Feasible when completed and every violation is non-positive.
    pub fn is_feasible(&self) -> bool {
        self.values.is_some()
            && self
                .constraint_violations
                .as_ref()
                .map(|v| v.iter().all(|x| *x <= 0.0))
                .unwrap_or(true)
    }
}

/// Converts a raw metrics mapping into objective values and violations.
#[derive(Debug, Clone)]
pub struct ObjectiveEvaluator {
    objectives: Vec<ObjectiveSpec>,
    constraints: Vec<ConstraintSpec>,
    sanitize: SanitizeConfig,
    missing_violation: f64,
}

impl ObjectiveEvaluator {
    pub fn new(space: &SearchSpace) -> Self {
        Self {
            objectives: space.objectives.clone(),
            constraints: space.enabled_constraints().into_iter().cloned().collect(),
            sanitize: space.sanitize.clone(),
            missing_violation: MISSING_CONSTRAINT_VIOLATION,
        }
    }

    /// Override the violation recorded for missing constraint metrics.
    pub fn with_missing_violation(mut self, violation: f64) -> Self {
        self.missing_violation = violation;
        self
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    fn sanitize_gate_open(&self, metrics: &MetricMap) -> bool {
        if !self.sanitize.enabled {
            return false;
        }
        match metrics.get(metric::TOTAL_TRADES) {
            Some(trades) if trades.is_finite() => *trades <= self.sanitize.trades_threshold as f64,
            _ => false,
        }
    }

    fn objective_value(&self, name: &str, metrics: &MetricMap, gate_open: bool, sanitized: &mut Vec<String>) -> f64 {
        let raw = metrics.get(name).copied();
        if gate_open {
            if SANITIZE_ANY_NON_FINITE.contains(&name) {
                if !raw.map(f64::is_finite).unwrap_or(false) {
                    sanitized.push(name.to_string());
                    return 0.0;
                }
            } else if name == metric::PROFIT_FACTOR && raw.map(f64::is_nan).unwrap_or(true) {
                sanitized.push(name.to_string());
                return 0.0;
            }
        }
        raw.unwrap_or(f64::NAN)
    }

    /// Evaluate constraint violations from raw metrics.
    pub fn constraint_violations(&self, metrics: &MetricMap) -> Vec<f64> {
        self.constraints
            .iter()
            .map(|c| match metrics.get(&c.metric) {
                Some(v) if v.is_finite() => match c.op {
                    ConstraintOp::Gte => c.threshold - v,
                    ConstraintOp::Lte => v - c.threshold,
                },
                _ => self.missing_violation,
            })
            .collect()
    }

    /// Apply the evaluation rules to one trial's metrics.
    pub fn evaluate(&self, metrics: &MetricMap) -> Evaluation {
        let pf_selected = self.objectives.iter().any(|o| o.metric == metric::PROFIT_FACTOR);
        if pf_selected {
            if let Some(pf) = metrics.get(metric::PROFIT_FACTOR) {
                if pf.is_infinite() {
                    return Evaluation::failed(FailureReason::InfiniteProfitFactor);
                }
            }
        }

        let gate_open = self.sanitize_gate_open(metrics);
        let mut sanitized = Vec::new();
        let values: Vec<f64> = self
            .objectives
            .iter()
            .map(|o| self.objective_value(&o.metric, metrics, gate_open, &mut sanitized))
            .collect();

        if let Some(bad) = self.objectives.iter().zip(&values).find(|(_, v)| !v.is_finite()) {
            let mut failed = Evaluation::failed(FailureReason::NonFiniteObjective {
                metric: bad.0.metric.clone(),
            });
            failed.sanitized = sanitized;
            return failed;
        }

        Evaluation {
            values: Some(values),
            constraint_violations: Some(self.constraint_violations(metrics)),
            sanitized,
            failure: None,
        }
    }
}

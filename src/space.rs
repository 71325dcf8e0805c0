//! Search space model: tunable parameters, objectives, and constraints.
//!
//! A [`SearchSpace`] is the declarative description every other component
//! works from. Parameter declaration order is significant: coverage schedules,
//! sampler proposals and exported records all iterate parameters in that order.
//!
//! # Example
//!
//! ```
//! use sieve::space::{ObjectiveSpec, ParamKind, ParamSpec, SearchSpace};
//!
//! let space = SearchSpace::new(vec![
//!     ParamSpec::int("fast_period", 5, 20, 1),
//!     ParamSpec::int("slow_period", 20, 60, 5),
//!     ParamSpec::categorical("direction", &["long", "both"]),
//! ])
//! .with_objective(ObjectiveSpec::new("net_profit_pct"));
//!
//! assert!(space.validate().is_ok());
//! ```

use crate::error::{OptimizeError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Maximum number of simultaneous objectives.
pub const MAX_OBJECTIVES: usize = 6;

/// Well-known metric names produced by the standard metrics calculator.
pub mod metric {
    pub const NET_PROFIT_PCT: &str = "net_profit_pct";
    pub const MAX_DRAWDOWN_PCT: &str = "max_drawdown_pct";
    pub const TOTAL_TRADES: &str = "total_trades";
    pub const WIN_RATE: &str = "win_rate";
    pub const SHARPE_RATIO: &str = "sharpe_ratio";
    pub const SORTINO_RATIO: &str = "sortino_ratio";
    pub const PROFIT_FACTOR: &str = "profit_factor";
    pub const SQN: &str = "sqn";
    pub const ROMAD: &str = "romad";
    pub const ULCER_INDEX: &str = "ulcer_index";
    pub const AVG_TRADE_PCT: &str = "avg_trade_pct";
}

/// Optimization direction of an objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Direction {
    /// Default direction for a well-known metric, `None` for unknown names.
    pub fn for_metric(name: &str) -> Option<Self> {
        match name {
            metric::NET_PROFIT_PCT
            | metric::SHARPE_RATIO
            | metric::SORTINO_RATIO
            | metric::PROFIT_FACTOR
            | metric::SQN
            | metric::WIN_RATE
            | metric::ROMAD
            | metric::AVG_TRADE_PCT => Some(Direction::Maximize),
            metric::MAX_DRAWDOWN_PCT | metric::ULCER_INDEX => Some(Direction::Minimize),
            _ => None,
        }
    }

    /// Orient a value so that larger is always better.
    pub fn score(self, value: f64) -> f64 {
        match self {
            Direction::Maximize => value,
            Direction::Minimize => -value,
        }
    }

    /// Whether `a` is strictly better than `b`.
    pub fn is_better(self, a: f64, b: f64) -> bool {
        match self {
            Direction::Maximize => a > b,
            Direction::Minimize => a < b,
        }
    }

    /// Ordering that places better values first.
    pub fn best_first(self, a: f64, b: f64) -> Ordering {
        match self {
            Direction::Maximize => b.total_cmp(&a),
            Direction::Minimize => a.total_cmp(&b),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Maximize => write!(f, "maximize"),
            Direction::Minimize => write!(f, "minimize"),
        }
    }
}

/// A concrete value assigned to one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Categorical(String),
}

impl ParamValue {
    /// Numeric view of the value (`None` for categoricals).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Categorical(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Categorical(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{:.6}", v),
            ParamValue::Categorical(v) => write!(f, "{}", v),
        }
    }
}

/// One complete parameter assignment, keyed by parameter name.
pub type ParamSet = BTreeMap<String, ParamValue>;

/// Render a parameter set as `name=value` pairs.
pub fn format_params(params: &ParamSet) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn default_int_step() -> i64 {
    1
}

/// Type, bounds and step of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Int {
        low: i64,
        high: i64,
        #[serde(default = "default_int_step")]
        step: i64,
    },
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        step: Option<f64>,
    },
    Categorical {
        choices: Vec<String>,
    },
}

impl ParamKind {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ParamKind::Categorical { .. })
    }

    /// Number of distinct grid values, `None` for continuous floats.
    pub fn cardinality(&self) -> Option<usize> {
        match self {
            ParamKind::Int { low, high, step } => Some(((high - low) / step) as usize + 1),
            ParamKind::Float {
                low,
                high,
                step: Some(step),
            } => Some(((high - low) / step + 1e-9).floor() as usize + 1),
            ParamKind::Float { step: None, .. } => None,
            ParamKind::Categorical { choices } => Some(choices.len()),
        }
    }

    /// Map a unit-interval coordinate onto the parameter's domain, snapping to
    /// the declared step.
    pub fn denormalize(&self, u: f64) -> ParamValue {
        let u = u.clamp(0.0, 1.0);
        match self {
            ParamKind::Int { low, step, .. } => {
                let count = self.cardinality().unwrap_or(1);
                let idx = ((u * count as f64).floor() as usize).min(count - 1);
                ParamValue::Int(low + idx as i64 * step)
            }
            ParamKind::Float {
                low,
                step: Some(step),
                ..
            } => {
                let count = self.cardinality().unwrap_or(1);
                let idx = ((u * count as f64).floor() as usize).min(count - 1);
                ParamValue::Float(low + idx as f64 * step)
            }
            ParamKind::Float {
                low,
                high,
                step: None,
            } => ParamValue::Float(low + u * (high - low)),
            ParamKind::Categorical { choices } => {
                let idx = ((u * choices.len() as f64).floor() as usize).min(choices.len() - 1);
                ParamValue::Categorical(choices[idx].clone())
            }
        }
    }

    /// Inverse of [`denormalize`](Self::denormalize) for numeric values.
    pub fn normalize(&self, value: &ParamValue) -> Option<f64> {
        match self {
            ParamKind::Int { low, high, .. } => {
                let v = value.as_f64()?;
                if high == low {
                    return Some(0.5);
                }
                Some((v - *low as f64) / (*high - *low) as f64)
            }
            ParamKind::Float { low, high, .. } => {
                let v = value.as_f64()?;
                if (high - low).abs() < f64::EPSILON {
                    return Some(0.5);
                }
                Some((v - low) / (high - low))
            }
            ParamKind::Categorical { choices } => {
                let s = value.as_str()?;
                let idx = choices.iter().position(|c| c == s)?;
                Some((idx as f64 + 0.5) / choices.len() as f64)
            }
        }
    }

    /// Whether `value` lies inside the domain and on the step grid.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamKind::Int { low, high, step }, ParamValue::Int(v)) => {
                v >= low && v <= high && (v - low) % step == 0
            }
            (ParamKind::Float { low, high, step }, ParamValue::Float(v)) => {
                if *v < *low - 1e-9 || *v > *high + 1e-9 {
                    return false;
                }
                match step {
                    Some(step) => {
                        let k = (v - low) / step;
                        (k - k.round()).abs() < 1e-6
                    }
                    None => true,
                }
            }
            (ParamKind::Categorical { choices }, ParamValue::Categorical(v)) => {
                choices.iter().any(|c| c == v)
            }
            _ => false,
        }
    }

    /// Draw a uniformly distributed value.
    pub fn sample(&self, rng: &mut impl Rng) -> ParamValue {
        self.denormalize(rng.gen::<f64>())
    }

    /// Move a numeric value by `steps` grid steps (or by `steps * float_fraction`
    /// of the range for continuous floats). Returns `None` when the result falls
    /// outside the bounds or the parameter is categorical.
    pub fn shift(&self, value: &ParamValue, steps: i64, float_fraction: f64) -> Option<ParamValue> {
        let shifted = match (self, value) {
            (ParamKind::Int { step, .. }, ParamValue::Int(v)) => ParamValue::Int(v + steps * step),
            (ParamKind::Float { step: Some(step), .. }, ParamValue::Float(v)) => {
                ParamValue::Float(v + steps as f64 * step)
            }
            (ParamKind::Float { low, high, step: None }, ParamValue::Float(v)) => {
                ParamValue::Float(v + steps as f64 * float_fraction * (high - low))
            }
            _ => return None,
        };
        if self.contains(&shifted) {
            Some(shifted)
        } else {
            None
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        match self {
            ParamKind::Int { low, high, step } => {
                if *step < 1 {
                    return Err(OptimizeError::InvalidSearchSpace(format!(
                        "parameter '{}' has step {} (must be >= 1)",
                        name, step
                    )));
                }
                if low > high {
                    return Err(OptimizeError::InvalidSearchSpace(format!(
                        "parameter '{}' has low {} > high {}",
                        name, low, high
                    )));
                }
            }
            ParamKind::Float { low, high, step } => {
                if !low.is_finite() || !high.is_finite() || low > high {
                    return Err(OptimizeError::InvalidSearchSpace(format!(
                        "parameter '{}' has invalid bounds [{}, {}]",
                        name, low, high
                    )));
                }
                if let Some(step) = step {
                    if !(*step > 0.0) || !step.is_finite() {
                        return Err(OptimizeError::InvalidSearchSpace(format!(
                            "parameter '{}' has non-positive step {}",
                            name, step
                        )));
                    }
                }
            }
            ParamKind::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(OptimizeError::InvalidSearchSpace(format!(
                        "categorical parameter '{}' has no choices",
                        name
                    )));
                }
                let unique: HashSet<&String> = choices.iter().collect();
                if unique.len() != choices.len() {
                    return Err(OptimizeError::InvalidSearchSpace(format!(
                        "categorical parameter '{}' has duplicate choices",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A named tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn int(name: impl Into<String>, low: i64, high: i64, step: i64) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Int { low, high, step },
        }
    }

    pub fn float(name: impl Into<String>, low: f64, high: f64, step: Option<f64>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Float { low, high, step },
        }
    }

    pub fn categorical(name: impl Into<String>, choices: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Categorical {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
        }
    }
}

/// A selected objective metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveSpec {
    pub metric: String,
    /// Explicit direction; falls back to the metric's well-known direction.
    #[serde(default)]
    pub direction: Option<Direction>,
}

impl ObjectiveSpec {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            direction: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Resolved direction (maximize when neither explicit nor well-known).
    pub fn direction(&self) -> Direction {
        self.direction
            .or_else(|| Direction::for_metric(&self.metric))
            .unwrap_or(Direction::Maximize)
    }
}

/// Comparison operator of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
}

impl fmt::Display for ConstraintOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintOp::Gte => write!(f, ">="),
            ConstraintOp::Lte => write!(f, "<="),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A feasibility constraint on a raw metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub metric: String,
    pub op: ConstraintOp,
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ConstraintSpec {
    pub fn new(metric: impl Into<String>, op: ConstraintOp, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            op,
            threshold,
            enabled: true,
        }
    }
}

/// Sanitization of non-finite metrics on low-trade-count trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeConfig {
    pub enabled: bool,
    /// The gate opens only when the trade count is at most this value.
    pub trades_threshold: u32,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trades_threshold: 0,
        }
    }
}

/// Which sampler drives adaptive proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Random,
    Tpe,
    Nsga2,
}

/// Sampler choice and its tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub kind: SamplerKind,
    /// TPE: random proposals before the density model kicks in.
    pub n_startup_trials: usize,
    /// TPE: fraction of completed trials treated as "good".
    pub gamma: f64,
    /// TPE: candidates drawn per proposal.
    pub n_candidates: usize,
    /// NSGA-II: generation size.
    pub population_size: usize,
    /// NSGA-II: per-parameter mutation probability (default `1 / n_params`).
    pub mutation_prob: Option<f64>,
    /// NSGA-II: probability of crossover versus cloning a parent.
    pub crossover_prob: f64,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: SamplerKind::Tpe,
            n_startup_trials: 20,
            gamma: 0.25,
            n_candidates: 24,
            population_size: 50,
            mutation_prob: None,
            crossover_prob: 0.9,
            seed: 42,
        }
    }
}

/// Complete declarative description of an optimization problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub params: Vec<ParamSpec>,
    pub objectives: Vec<ObjectiveSpec>,
    /// Required when two or more objectives are selected.
    #[serde(default)]
    pub primary_objective: Option<String>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
    #[serde(default)]
    pub sanitize: SanitizeConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
}

impl SearchSpace {
    /// Create a space with the given parameters and no objectives yet.
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self {
            params,
            objectives: Vec::new(),
            primary_objective: None,
            constraints: Vec::new(),
            sanitize: SanitizeConfig::default(),
            sampler: SamplerConfig::default(),
        }
    }

    pub fn with_objective(mut self, objective: ObjectiveSpec) -> Self {
        self.objectives.push(objective);
        self
    }

    pub fn with_primary(mut self, metric: impl Into<String>) -> Self {
        self.primary_objective = Some(metric.into());
        self
    }

    pub fn with_constraint(mut self, constraint: ConstraintSpec) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_sanitize(mut self, enabled: bool, trades_threshold: u32) -> Self {
        self.sanitize = SanitizeConfig {
            enabled,
            trades_threshold,
        };
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(OptimizeError::InvalidSearchSpace(
                "at least one parameter is required".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for p in &self.params {
            if !names.insert(p.name.as_str()) {
                return Err(OptimizeError::InvalidSearchSpace(format!(
                    "duplicate parameter '{}'",
                    p.name
                )));
            }
            p.kind.validate(&p.name)?;
        }

        if self.objectives.is_empty() || self.objectives.len() > MAX_OBJECTIVES {
            return Err(OptimizeError::InvalidSearchSpace(format!(
                "between 1 and {} objectives are required, got {}",
                MAX_OBJECTIVES,
                self.objectives.len()
            )));
        }
        let mut objective_names = HashSet::new();
        for o in &self.objectives {
            if !objective_names.insert(o.metric.as_str()) {
                return Err(OptimizeError::InvalidSearchSpace(format!(
                    "objective '{}' selected twice",
                    o.metric
                )));
            }
            if o.direction.is_none() && Direction::for_metric(&o.metric).is_none() {
                return Err(OptimizeError::InvalidSearchSpace(format!(
                    "objective '{}' is not a known metric and needs an explicit direction",
                    o.metric
                )));
            }
        }

        if self.objectives.len() >= 2 {
            match &self.primary_objective {
                None => {
                    return Err(OptimizeError::InvalidSearchSpace(
                        "a primary objective is required with multiple objectives".to_string(),
                    ))
                }
                Some(p) if !objective_names.contains(p.as_str()) => {
                    return Err(OptimizeError::InvalidSearchSpace(format!(
                        "primary objective '{}' is not a selected objective",
                        p
                    )))
                }
                _ => {}
            }
        }

        for c in &self.constraints {
            if !c.threshold.is_finite() {
                return Err(OptimizeError::InvalidSearchSpace(format!(
                    "constraint on '{}' has a non-finite threshold",
                    c.metric
                )));
            }
        }

        let s = &self.sampler;
        if !(s.gamma > 0.0 && s.gamma < 1.0) {
            return Err(OptimizeError::InvalidSearchSpace(format!(
                "sampler gamma {} must be in (0, 1)",
                s.gamma
            )));
        }
        if s.population_size < 2 {
            return Err(OptimizeError::InvalidSearchSpace(
                "sampler population_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn numeric_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.kind.is_numeric())
    }

    pub fn categorical_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| !p.kind.is_numeric())
    }

    pub fn is_multi_objective(&self) -> bool {
        self.objectives.len() > 1
    }

    /// Index of the primary objective inside the objective vector.
    pub fn primary_index(&self) -> usize {
        self.primary_objective
            .as_ref()
            .and_then(|p| self.objectives.iter().position(|o| &o.metric == p))
            .unwrap_or(0)
    }

    pub fn primary(&self) -> &ObjectiveSpec {
        &self.objectives[self.primary_index()]
    }

    pub fn directions(&self) -> Vec<Direction> {
        self.objectives.iter().map(|o| o.direction()).collect()
    }

    /// Constraints that participate in evaluation, in declaration order.
    pub fn enabled_constraints(&self) -> Vec<&ConstraintSpec> {
        self.constraints.iter().filter(|c| c.enabled).collect()
    }

    pub fn has_constraints(&self) -> bool {
        self.constraints.iter().any(|c| c.enabled)
    }

    /// Whether `params` assigns an in-domain value to every parameter.
    pub fn contains(&self, params: &ParamSet) -> bool {
        params.len() == self.params.len()
            && self
                .params
                .iter()
                .all(|p| params.get(&p.name).map(|v| p.kind.contains(v)).unwrap_or(false))
    }

    /// Draw one uniformly random assignment.
    pub fn sample(&self, rng: &mut impl Rng) -> ParamSet {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.kind.sample(rng)))
            .collect()
    }
}

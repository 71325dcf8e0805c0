//! Configuration file support.
//!
//! An optimization or walk-forward run is described by one TOML document so
//! that runs are reproducible. Stage and section tables that are left out
//! fall back to their defaults; a post-process stage without a table is
//! disabled.

use crate::coverage::CoverageConfig;
use crate::data::{parse_boundary, slice_range, DataConfig};
use crate::error::{OptimizeError, Result};
use crate::orchestrator::{Budget, ExecutionMode, OrchestratorConfig};
use crate::postprocess::PostProcessConfig;
use crate::space::SearchSpace;
use crate::types::Bar;
use crate::walkforward::WalkForwardConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SieveFileConfig {
    #[serde(default)]
    pub data: DataSettings,
    /// Parameters, objectives, constraints and sampler.
    pub search: SearchSpace,
    #[serde(default)]
    pub optimization: OptimizationSettings,
    #[serde(default)]
    pub simulator: SimulatorSettings,
    #[serde(default)]
    pub walkforward: WalkForwardConfig,
    #[serde(default)]
    pub postprocess: PostProcessConfig,
}

/// Data settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// Path to the CSV file; the CLI may override it.
    pub path: Option<String>,
    /// First bar to use. A date-only value starts at midnight.
    pub start: Option<String>,
    /// Last bar to use. A date-only value includes the whole day.
    pub end: Option<String>,
    /// Explicit timestamp format; auto-detected otherwise.
    pub date_format: Option<String>,
}

impl DataSettings {
    pub fn csv_config(&self) -> DataConfig {
        DataConfig {
            date_format: self.date_format.clone(),
            ..Default::default()
        }
    }

    /// Restrict `bars` to the configured start/end.
    pub fn slice<'a>(&self, bars: &'a [Bar]) -> Result<&'a [Bar]> {
        let start = self.start.as_deref().map(parse_boundary).transpose()?;
        let end = self.end.as_deref().map(parse_boundary).transpose()?;
        slice_range(bars, start, end)
    }
}

/// Budgets, execution and coverage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    pub max_trials: Option<usize>,
    pub max_duration_secs: Option<u64>,
    pub stagnation_trials: Option<usize>,
    /// Number of workers; 1 runs in-process.
    pub workers: usize,
    /// Upper bound on the per-worker stagnation budget with several workers.
    pub stagnation_cap: usize,
    pub coverage_trials: usize,
    pub coverage_seed: u64,
    pub min_points_per_dim: usize,
    pub recommended_points_per_dim: usize,
    pub warmup_bars: usize,
    /// Violation recorded for missing or non-finite constraint metrics.
    pub missing_constraint_violation: f64,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        let coverage = CoverageConfig::default();
        Self {
            max_trials: orchestrator.budget.max_trials,
            max_duration_secs: None,
            stagnation_trials: None,
            workers: 1,
            stagnation_cap: orchestrator.stagnation_cap,
            coverage_trials: coverage.n_trials,
            coverage_seed: coverage.seed,
            min_points_per_dim: coverage.min_points_per_dim,
            recommended_points_per_dim: coverage.recommended_points_per_dim,
            warmup_bars: 0,
            missing_constraint_violation: orchestrator.missing_constraint_violation,
        }
    }
}

impl OptimizationSettings {
    pub fn coverage(&self) -> CoverageConfig {
        CoverageConfig {
            n_trials: self.coverage_trials,
            seed: self.coverage_seed,
            min_points_per_dim: self.min_points_per_dim,
            recommended_points_per_dim: self.recommended_points_per_dim,
        }
    }

    /// Convert to the orchestrator's configuration.
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        let mode = if self.workers > 1 {
            ExecutionMode::MultiProcess { workers: self.workers }
        } else {
            ExecutionMode::SingleProcess
        };
        OrchestratorConfig {
            budget: Budget {
                max_trials: self.max_trials,
                max_duration_secs: self.max_duration_secs,
                stagnation_trials: self.stagnation_trials,
            },
            mode,
            coverage: self.coverage(),
            warmup_bars: self.warmup_bars,
            stagnation_cap: self.stagnation_cap,
            missing_constraint_violation: self.missing_constraint_violation,
        }
    }
}

/// Reference simulator and metrics settings used by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub initial_balance: f64,
    /// Commission as a fraction of traded notional, per side.
    pub commission_rate: f64,
    /// Periods per year for annualized ratios.
    pub annualization_factor: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            commission_rate: 0.0,
            annualization_factor: 252.0,
        }
    }
}

impl SieveFileConfig {
    pub fn new(search: SearchSpace) -> Self {
        Self {
            data: DataSettings::default(),
            search,
            optimization: OptimizationSettings::default(),
            simulator: SimulatorSettings::default(),
            walkforward: WalkForwardConfig::default(),
            postprocess: PostProcessConfig::default(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| OptimizeError::ConfigError(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.search.validate()?;
        let orchestrator = self.optimization.to_orchestrator_config();
        orchestrator.validate()?;
        self.walkforward.validate()?;
        self.postprocess.validate()?;
        if !(self.simulator.initial_balance > 0.0) {
            return Err(OptimizeError::ConfigError(
                "simulator initial_balance must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.simulator.commission_rate) {
            return Err(OptimizeError::ConfigError(
                "simulator commission_rate must be in [0, 1)".to_string(),
            ));
        }
        for bound in [&self.data.start, &self.data.end].into_iter().flatten() {
            parse_boundary(bound)?;
        }
        Ok(())
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# sieve run configuration

[data]
path = "data/sample.csv"
# start = "2022-01-01"
# end = "2023-12-31"

[search]
primary_objective = "sharpe_ratio"

[[search.params]]
name = "fast_period"
type = "int"
low = 5
high = 30
step = 1

[[search.params]]
name = "slow_period"
type = "int"
low = 40
high = 120
step = 5

[[search.params]]
name = "direction"
type = "categorical"
choices = ["long", "both"]

[[search.objectives]]
metric = "sharpe_ratio"

[[search.objectives]]
metric = "max_drawdown_pct"

[[search.constraints]]
metric = "total_trades"
op = ">="
threshold = 5.0

[search.sanitize]
enabled = true
trades_threshold = 0

[search.sampler]
kind = "nsga2"
population_size = 30
seed = 42

[optimization]
max_trials = 200
# max_duration_secs = 600
# stagnation_trials = 50
workers = 1
coverage_trials = 24
warmup_bars = 120

[simulator]
initial_balance = 10000.0
commission_rate = 0.001

[walkforward]
mode = "adaptive"
is_days = 365
oos_days = 60

[walkforward.adaptive]
cusum_k = 0.5
cusum_h = 5.0
drawdown_mult = 1.5
inactivity_mult = 3.0
max_oos_days = 90

[postprocess]
top_k = 10

[postprocess.deflation]
min_sharpe = 0.0

[postprocess.forward_test]
period_days = 60
rank_by = "degradation"

[postprocess.stress_test]
steps = 1
float_fraction = 0.05

[postprocess.oos_test]
period_days = 60
"#
        .to_string()
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<SieveFileConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {}", path.display());
    let content = fs::read_to_string(path)?;
    let config = SieveFileConfig::from_toml_str(&content)?;
    config.validate()?;
    Ok(config)
}

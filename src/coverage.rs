//! Deterministic coverage scheduling of initial trials.
//!
//! Before adaptive sampling starts, the search space is pre-seeded with a
//! stratified Latin-Hypercube design:
//!
//! 1. The categorical parameter with the most choices becomes the
//!    stratification axis and the requested point count is split across its
//!    choices as evenly as possible (truncated, never padded, when there are
//!    fewer points than choices).
//! 2. Inside each stratum every numeric dimension is cut into one cell per
//!    point; each cell is used exactly once per dimension and sampled at its
//!    centre before snapping to the parameter step.
//! 3. Remaining categorical parameters are assigned round-robin.
//! 4. The finished schedule is shuffled once with a seeded generator so the
//!    trial order does not replay the axis order.
//!
//! The schedule depends only on the search space, the point count and the
//! seed, so every worker of a multi-worker run sees the exact same design.

use crate::space::{ParamKind, ParamSet, ParamValue, SearchSpace};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Coverage scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Number of coverage points enqueued before adaptive sampling (0 disables).
    pub n_trials: usize,
    /// Seed for cell permutations and the final shuffle.
    pub seed: u64,
    /// Points per numeric dimension behind the minimum count.
    pub min_points_per_dim: usize,
    /// Points per numeric dimension behind the recommended count.
    pub recommended_points_per_dim: usize,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            n_trials: 0,
            seed: 42,
            min_points_per_dim: 1,
            recommended_points_per_dim: 3,
        }
    }
}

impl CoverageConfig {
    pub fn new(n_trials: usize) -> Self {
        Self {
            n_trials,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// A finished coverage schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveragePlan {
    /// Parameter assignments in enqueue order.
    pub points: Vec<ParamSet>,
    /// Name of the stratification axis, if any categorical parameter exists.
    pub stratify_axis: Option<String>,
    /// Points allocated to each choice of the stratification axis.
    pub strata_sizes: Vec<usize>,
    pub minimum: usize,
    pub recommended: usize,
    /// Non-fatal advisory when the requested count is below the recommendation.
    pub advisory: Option<String>,
}

impl CoveragePlan {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Index of the categorical parameter with the most choices (first wins ties).
fn stratify_axis(space: &SearchSpace) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (i, p) in space.params.iter().enumerate() {
        if let ParamKind::Categorical { choices } = &p.kind {
            if best.map(|(_, n)| choices.len() > n).unwrap_or(true) {
                best = Some((i, choices.len()));
            }
        }
    }
    best.map(|(i, _)| i)
}

fn strata_count(space: &SearchSpace) -> usize {
    stratify_axis(space)
        .and_then(|i| space.params[i].kind.cardinality())
        .unwrap_or(1)
        .max(1)
}

/// Minimum sensible number of coverage points for this space.
pub fn minimum_trials(space: &SearchSpace, config: &CoverageConfig) -> usize {
    let dims = space.numeric_params().count();
    strata_count(space) * (dims * config.min_points_per_dim + 1)
}

/// Recommended number of coverage points for this space.
pub fn recommended_trials(space: &SearchSpace, config: &CoverageConfig) -> usize {
    let dims = space.numeric_params().count();
    strata_count(space) * (dims * config.recommended_points_per_dim + 1)
}

/// Advisory text when `n_trials` falls below the recommended count.
pub fn coverage_advisory(space: &SearchSpace, config: &CoverageConfig) -> Option<String> {
    let recommended = recommended_trials(space, config);
    if config.n_trials >= recommended {
        return None;
    }
    let minimum = minimum_trials(space, config);
    let severity = if config.n_trials < minimum {
        "below the minimum"
    } else {
        "below the recommended count"
    };
    Some(format!(
        "Coverage trials ({}) are {} for this search space (minimum {}, recommended {})",
        config.n_trials, severity, minimum, recommended
    ))
}

/// Split `n` points across `k` strata, truncating when `n < k`.
fn split_evenly(n: usize, k: usize) -> Vec<usize> {
    if n < k {
        return vec![1; n];
    }
    let base = n / k;
    let extra = n % k;
    (0..k).map(|i| base + usize::from(i < extra)).collect()
}

/// Build the coverage schedule for `space`.
pub fn schedule(space: &SearchSpace, config: &CoverageConfig) -> CoveragePlan {
    let minimum = minimum_trials(space, config);
    let recommended = recommended_trials(space, config);
    let advisory = coverage_advisory(space, config);
    if let Some(msg) = &advisory {
        if config.n_trials > 0 {
            warn!("{}", msg);
        }
    }

    let axis = stratify_axis(space);
    let axis_choices: Vec<String> = match axis.map(|i| &space.params[i].kind) {
        Some(ParamKind::Categorical { choices }) => choices.clone(),
        _ => Vec::new(),
    };
    let strata_sizes = if axis.is_some() {
        split_evenly(config.n_trials, axis_choices.len())
    } else if config.n_trials > 0 {
        vec![config.n_trials]
    } else {
        Vec::new()
    };

    let numeric: Vec<&crate::space::ParamSpec> = space.numeric_params().collect();
    let others: Vec<(usize, &crate::space::ParamSpec)> = space
        .params
        .iter()
        .enumerate()
        .filter(|(i, p)| !p.kind.is_numeric() && Some(*i) != axis)
        .collect();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut round_robin = vec![0usize; others.len()];
    let mut points = Vec::with_capacity(config.n_trials);

    for (stratum, &size) in strata_sizes.iter().enumerate() {
        // One permutation of cell indices per numeric dimension.
        let permutations: Vec<Vec<usize>> = numeric
            .iter()
            .map(|_| {
                let mut cells: Vec<usize> = (0..size).collect();
                cells.shuffle(&mut rng);
                cells
            })
            .collect();

        for i in 0..size {
            let mut params = ParamSet::new();
            for (d, p) in numeric.iter().enumerate() {
                let u = (permutations[d][i] as f64 + 0.5) / size as f64;
                params.insert(p.name.clone(), p.kind.denormalize(u));
            }
            if let Some(axis_idx) = axis {
                params.insert(
                    space.params[axis_idx].name.clone(),
                    ParamValue::Categorical(axis_choices[stratum].clone()),
                );
            }
            for (slot, (_, p)) in others.iter().enumerate() {
                if let ParamKind::Categorical { choices } = &p.kind {
                    let choice = &choices[round_robin[slot] % choices.len()];
                    round_robin[slot] += 1;
                    params.insert(p.name.clone(), ParamValue::Categorical(choice.clone()));
                }
            }
            points.push(params);
        }
    }

    points.shuffle(&mut rng);
    debug!(
        "Coverage schedule: {} points over {} strata",
        points.len(),
        strata_sizes.len()
    );

    CoveragePlan {
        points,
        stratify_axis: axis.map(|i| space.params[i].name.clone()),
        strata_sizes,
        minimum,
        recommended,
        advisory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ObjectiveSpec, ParamSpec};
    use std::collections::{HashMap, HashSet};

    fn mixed_space() -> SearchSpace {
        SearchSpace::new(vec![
            ParamSpec::int("fast", 1, 100, 1),
            ParamSpec::float("stop", 0.0, 1.0, None),
            ParamSpec::categorical("mode", &["a", "b", "c"]),
            ParamSpec::categorical("filter", &["on", "off"]),
        ])
        .with_objective(ObjectiveSpec::new("net_profit_pct"))
    }

    #[test]
    fn test_exact_count_and_determinism() {
        let space = mixed_space();
        let config = CoverageConfig::new(20);
        let a = schedule(&space, &config);
        let b = schedule(&space, &config);
        assert_eq!(a.len(), 20);
        assert_eq!(a.points, b.points);
        for p in &a.points {
            assert!(space.contains(p));
        }
    }

    #[test]
    fn test_stratifies_on_largest_categorical() {
        let plan = schedule(&mixed_space(), &CoverageConfig::new(20));
        assert_eq!(plan.stratify_axis.as_deref(), Some("mode"));
        assert_eq!(plan.strata_sizes, vec![7, 7, 6]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for p in &plan.points {
            *counts.entry(p["mode"].to_string()).or_default() += 1;
        }
        assert_eq!(counts["a"], 7);
        assert_eq!(counts["b"], 7);
        assert_eq!(counts["c"], 6);
    }

    #[test]
    fn test_latin_hypercube_cells_unique_within_stratum() {
        let plan = schedule(&mixed_space(), &CoverageConfig::new(30));
        for choice in ["a", "b", "c"] {
            let stratum: Vec<&ParamSet> = plan
                .points
                .iter()
                .filter(|p| p["mode"].as_str() == Some(choice))
                .collect();
            let fast: HashSet<i64> = stratum.iter().map(|p| p["fast"].as_i64().unwrap()).collect();
            assert_eq!(fast.len(), stratum.len(), "fast values reused in stratum {}", choice);
            let stops: Vec<f64> = stratum.iter().map(|p| p["stop"].as_f64().unwrap()).collect();
            let cells: HashSet<usize> = stops
                .iter()
                .map(|s| (s * stratum.len() as f64).floor() as usize)
                .collect();
            assert_eq!(cells.len(), stratum.len());
        }
    }

    #[test]
    fn test_round_robin_secondary_categorical() {
        let plan = schedule(&mixed_space(), &CoverageConfig::new(20));
        let on = plan
            .points
            .iter()
            .filter(|p| p["filter"].as_str() == Some("on"))
            .count();
        assert_eq!(on, 10);
    }

    #[test]
    fn test_truncates_when_fewer_points_than_choices() {
        let plan = schedule(&mixed_space(), &CoverageConfig::new(2));
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.strata_sizes, vec![1, 1]);
        let modes: HashSet<String> = plan.points.iter().map(|p| p["mode"].to_string()).collect();
        assert!(!modes.contains("c"));
    }

    #[test]
    fn test_numeric_only_space() {
        let space = SearchSpace::new(vec![
            ParamSpec::int("a", 0, 9, 1),
            ParamSpec::int("b", 0, 9, 1),
        ])
        .with_objective(ObjectiveSpec::new("sharpe_ratio"));
        let plan = schedule(&space, &CoverageConfig::new(10));
        assert!(plan.stratify_axis.is_none());
        let a: HashSet<i64> = plan.points.iter().map(|p| p["a"].as_i64().unwrap()).collect();
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn test_minimum_and_recommended() {
        let space = mixed_space();
        let config = CoverageConfig::new(5);
        // 3 strata, 2 numeric dimensions.
        assert_eq!(minimum_trials(&space, &config), 3 * (2 + 1));
        assert_eq!(recommended_trials(&space, &config), 3 * (2 * 3 + 1));

        let advisory = coverage_advisory(&space, &config).unwrap();
        assert!(advisory.contains("below the minimum"));
        assert!(coverage_advisory(&space, &CoverageConfig::new(21)).is_none());
    }

    #[test]
    fn test_seed_changes_order_not_content_shape() {
        let space = mixed_space();
        let a = schedule(&space, &CoverageConfig::new(12).with_seed(1));
        let b = schedule(&space, &CoverageConfig::new(12).with_seed(2));
        assert_eq!(a.len(), b.len());
        assert_eq!(a.strata_sizes, b.strata_sizes);
    }
}

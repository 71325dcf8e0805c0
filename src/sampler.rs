//! Pluggable trial samplers behind a narrow propose/report contract.
//!
//! The orchestrator never looks inside a sampler. It pre-seeds coverage
//! points with [`Sampler::enqueue`], asks for the next assignment with
//! [`Sampler::propose`] and feeds every finalized trial back through
//! [`Sampler::report`]. Any implementation honouring that contract can be
//! plugged in through a [`SamplerFactory`].
//!
//! Built-in implementations:
//!
//! - [`RandomSampler`]: uniform draws, useful as a baseline.
//! - [`TpeSampler`]: tree-structured Parzen estimator over the primary
//!   objective. Failed and infeasible trials always land in the "bad" group.
//! - [`Nsga2Sampler`]: elitist genetic search with constrained domination,
//!   binary tournaments, uniform crossover and per-parameter mutation.

use crate::ranking::{crowding_distance, non_dominated_sort};
use crate::space::{Direction, ParamKind, ParamSet, ParamValue, SamplerKind, SearchSpace};
use crate::study::Trial;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outcome of one trial as seen by a sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome<'a> {
    /// Objective vector, `None` for failed trials.
    pub values: Option<&'a [f64]>,
    pub constraint_violations: Option<&'a [f64]>,
}

impl<'a> Outcome<'a> {
    pub fn of(trial: &'a Trial) -> Self {
        Self {
            values: trial.values.as_deref(),
            constraint_violations: trial.constraint_violations.as_deref(),
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.values.is_some()
            && self
                .constraint_violations
                .map(|v| v.iter().all(|x| *x <= 0.0))
                .unwrap_or(true)
    }

    fn total_violation(&self) -> f64 {
        self.constraint_violations
            .map(|v| v.iter().filter(|x| **x > 0.0).sum())
            .unwrap_or(0.0)
    }
}

/// The contract every sampler implements.
pub trait Sampler: Send {
    /// Queue an assignment to be returned by a later `propose` before any
    /// adaptive proposal.
    fn enqueue(&mut self, params: ParamSet);

    /// Next parameter assignment to evaluate.
    fn propose(&mut self) -> ParamSet;

    /// Feed back the outcome of a finalized trial.
    fn report(&mut self, params: &ParamSet, outcome: Outcome<'_>);

    fn name(&self) -> &str;
}

/// Builds a sampler for a search space and seed.
pub type SamplerFactory = Arc<dyn Fn(&SearchSpace, u64) -> Box<dyn Sampler> + Send + Sync>;

/// Build the sampler selected in the search space configuration.
pub fn build_sampler(space: &SearchSpace, seed: u64) -> Box<dyn Sampler> {
    match space.sampler.kind {
        SamplerKind::Random => Box::new(RandomSampler::new(space.clone(), seed)),
        SamplerKind::Tpe => Box::new(TpeSampler::new(space.clone(), seed)),
        SamplerKind::Nsga2 => Box::new(Nsga2Sampler::new(space.clone(), seed)),
    }
}

/// Factory that defers to [`build_sampler`].
pub fn default_factory() -> SamplerFactory {
    Arc::new(|space: &SearchSpace, seed: u64| build_sampler(space, seed))
}

/// One reported observation.
#[derive(Debug, Clone)]
struct Observation {
    params: ParamSet,
    values: Option<Vec<f64>>,
    feasible: bool,
    violation: f64,
}

impl Observation {
    fn new(params: &ParamSet, outcome: Outcome<'_>) -> Self {
        Self {
            params: params.clone(),
            values: outcome.values.map(|v| v.to_vec()),
            feasible: outcome.is_feasible(),
            violation: outcome.total_violation(),
        }
    }
}

/// Uniform random sampler.
pub struct RandomSampler {
    space: SearchSpace,
    rng: StdRng,
    queue: VecDeque<ParamSet>,
}

impl RandomSampler {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
            queue: VecDeque::new(),
        }
    }
}

impl Sampler for RandomSampler {
    fn enqueue(&mut self, params: ParamSet) {
        self.queue.push_back(params);
    }

    fn propose(&mut self) -> ParamSet {
        match self.queue.pop_front() {
            Some(params) => params,
            None => self.space.sample(&mut self.rng),
        }
    }

    fn report(&mut self, _params: &ParamSet, _outcome: Outcome<'_>) {}

    fn name(&self) -> &str {
        "random"
    }
}

/// Tree-structured Parzen estimator sampler.
pub struct TpeSampler {
    space: SearchSpace,
    rng: StdRng,
    queue: VecDeque<ParamSet>,
    history: Vec<Observation>,
}

/// Kernel bandwidth floor in the unit interval.
const MIN_BANDWIDTH: f64 = 0.02;

impl TpeSampler {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
            queue: VecDeque::new(),
            history: Vec::new(),
        }
    }

    fn sample_categorical(
        &mut self,
        name: &str,
        choices: &[String],
        good: &[&Observation],
        bad: &[&Observation],
    ) -> ParamValue {
        let count = |group: &[&Observation]| -> Vec<f64> {
            let mut counts = vec![1.0; choices.len()];
            for o in group {
                if let Some(ParamValue::Categorical(v)) = o.params.get(name) {
                    if let Some(idx) = choices.iter().position(|c| c == v) {
                        counts[idx] += 1.0;
                    }
                }
            }
            counts
        };
        let good_counts = count(good);
        let bad_counts = count(bad);
        let good_total: f64 = good_counts.iter().sum();
        let bad_total: f64 = bad_counts.iter().sum();

        let idx = match WeightedIndex::new(&good_counts) {
            Ok(dist) => {
                let mut best = (0, f64::NEG_INFINITY);
                for _ in 0..self.space.sampler.n_candidates.max(1) {
                    let i = dist.sample(&mut self.rng);
                    let ratio = (good_counts[i] / good_total) / (bad_counts[i] / bad_total);
                    if ratio > best.1 {
                        best = (i, ratio);
                    }
                }
                best.0
            }
            Err(_) => self.rng.gen_range(0..choices.len()),
        };
        ParamValue::Categorical(choices[idx].clone())
    }

    fn sample_numeric(
        &mut self,
        name: &str,
        kind: &ParamKind,
        good: &[&Observation],
        bad: &[&Observation],
    ) -> ParamValue {
        let positions = |group: &[&Observation]| -> Vec<f64> {
            group
                .iter()
                .filter_map(|o| o.params.get(name))
                .filter_map(|v| kind.normalize(v))
                .collect()
        };
        let good_pos = positions(good);
        let bad_pos = positions(bad);
        if good_pos.is_empty() {
            return kind.sample(&mut self.rng);
        }

        let sigma = (1.0 / (good_pos.len() as f64 + 1.0).sqrt() * 0.25).max(MIN_BANDWIDTH);
        let density = |x: f64, centres: &[f64]| -> f64 {
            // Uniform prior component keeps the ratio finite.
            let prior = 1.0;
            let kernels: f64 = centres.iter().map(|c| gaussian_pdf(x, *c, sigma)).sum();
            (kernels + prior) / (centres.len() as f64 + 1.0)
        };

        let mut best = (good_pos[0], f64::NEG_INFINITY);
        for _ in 0..self.space.sampler.n_candidates.max(1) {
            let centre = good_pos[self.rng.gen_range(0..good_pos.len())];
            let candidate = match Normal::new(centre, sigma) {
                Ok(normal) => normal.sample(&mut self.rng).clamp(0.0, 1.0),
                Err(_) => centre,
            };
            let ratio = density(candidate, &good_pos) / density(candidate, &bad_pos);
            if ratio > best.1 {
                best = (candidate, ratio);
            }
        }
        kind.denormalize(best.0)
    }
}

/// Split history into good and bad observations by the primary objective.
fn tpe_split<'a>(space: &SearchSpace, history: &'a [Observation]) -> (Vec<&'a Observation>, Vec<&'a Observation>) {
    let index = space.primary_index();
    let direction = space.primary().direction();

    let mut ranked: Vec<&'a Observation> = history.iter().filter(|o| o.feasible).collect();
    ranked.sort_by(|a, b| {
        let va = a.values.as_ref().map(|v| v[index]).unwrap_or(f64::NAN);
        let vb = b.values.as_ref().map(|v| v[index]).unwrap_or(f64::NAN);
        direction.best_first(va, vb)
    });

    let n_good = ((ranked.len() as f64) * space.sampler.gamma).ceil() as usize;
    let n_good = n_good.clamp(1, ranked.len().max(1)).min(ranked.len());
    let good = ranked[..n_good].to_vec();
    let mut bad = ranked[n_good..].to_vec();
    bad.extend(history.iter().filter(|o| !o.feasible));
    (good, bad)
}

fn gaussian_pdf(x: f64, mean: f64, sigma: f64) -> f64 {
    let exponent = -0.5 * ((x - mean) / sigma).powi(2);
    (1.0 / (sigma * (2.0 * std::f64::consts::PI).sqrt())) * exponent.exp()
}

impl Sampler for TpeSampler {
    fn enqueue(&mut self, params: ParamSet) {
        self.queue.push_back(params);
    }

    fn propose(&mut self) -> ParamSet {
        if let Some(params) = self.queue.pop_front() {
            return params;
        }
        let feasible = self.history.iter().filter(|o| o.feasible).count();
        if self.history.len() < self.space.sampler.n_startup_trials || feasible == 0 {
            return self.space.sample(&mut self.rng);
        }

        // Detach the history so the rng can be borrowed while groups are alive.
        let history = std::mem::take(&mut self.history);
        let params = {
            let (good, bad) = tpe_split(&self.space, &history);
            let specs = self.space.params.clone();
            let mut params = ParamSet::new();
            for spec in &specs {
                let value = match &spec.kind {
                    ParamKind::Categorical { choices } => {
                        self.sample_categorical(&spec.name, choices, &good, &bad)
                    }
                    kind => self.sample_numeric(&spec.name, kind, &good, &bad),
                };
                params.insert(spec.name.clone(), value);
            }
            params
        };
        self.history = history;
        params
    }

    fn report(&mut self, params: &ParamSet, outcome: Outcome<'_>) {
        self.history.push(Observation::new(params, outcome));
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

/// NSGA-II genetic sampler.
pub struct Nsga2Sampler {
    space: SearchSpace,
    rng: StdRng,
    queue: VecDeque<ParamSet>,
    history: Vec<Observation>,
    /// Indices into `history` of the current parent population, best first.
    parents: Vec<usize>,
    parents_built_at: usize,
}

impl Nsga2Sampler {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
            queue: VecDeque::new(),
            history: Vec::new(),
            parents: Vec::new(),
            parents_built_at: 0,
        }
    }

    fn population_size(&self) -> usize {
        self.space.sampler.population_size
    }

    /// Elitist survivor selection under constrained domination.
    fn rebuild_parents(&mut self) {
        let directions: Vec<Direction> = self.space.directions();
        let size = self.population_size();
        let mut parents = Vec::with_capacity(size);

        let feasible: Vec<usize> = (0..self.history.len())
            .filter(|i| self.history[*i].feasible)
            .collect();
        let points: Vec<&[f64]> = feasible
            .iter()
            .filter_map(|i| self.history[*i].values.as_deref())
            .collect();

        for front in non_dominated_sort(&directions, &points) {
            if parents.len() >= size {
                break;
            }
            let front_points: Vec<&[f64]> = front.iter().map(|k| points[*k]).collect();
            let distance = crowding_distance(&front_points);
            let mut order: Vec<usize> = (0..front.len()).collect();
            order.sort_by(|a, b| distance[*b].total_cmp(&distance[*a]).then(front[*a].cmp(&front[*b])));
            for k in order {
                if parents.len() >= size {
                    break;
                }
                parents.push(feasible[front[k]]);
            }
        }

        if parents.len() < size {
            let mut infeasible: Vec<usize> = (0..self.history.len())
                .filter(|i| !self.history[*i].feasible && self.history[*i].values.is_some())
                .collect();
            infeasible.sort_by(|a, b| {
                self.history[*a]
                    .violation
                    .total_cmp(&self.history[*b].violation)
                    .then(a.cmp(b))
            });
            parents.extend(infeasible.into_iter().take(size - parents.len()));
        }

        self.parents = parents;
        self.parents_built_at = self.history.len();
    }

    /// Binary tournament: parents are ordered best first, so the lower
    /// position wins.
    fn tournament(&mut self) -> usize {
        let n = self.parents.len();
        let a = self.rng.gen_range(0..n);
        let b = self.rng.gen_range(0..n);
        self.parents[a.min(b)]
    }

    fn offspring(&mut self) -> ParamSet {
        let first = self.tournament();
        let second = self.tournament();
        let crossover = self.rng.gen::<f64>() < self.space.sampler.crossover_prob;
        let mutation_prob = self
            .space
            .sampler
            .mutation_prob
            .unwrap_or(1.0 / self.space.params.len().max(1) as f64);

        let specs = self.space.params.clone();
        let mut child = ParamSet::new();
        for spec in &specs {
            let source = if crossover && self.rng.gen::<bool>() { second } else { first };
            let inherited = self.history[source].params.get(&spec.name).cloned();
            let value = match inherited {
                Some(v) if self.rng.gen::<f64>() >= mutation_prob && spec.kind.contains(&v) => v,
                _ => spec.kind.sample(&mut self.rng),
            };
            child.insert(spec.name.clone(), value);
        }
        child
    }
}

impl Sampler for Nsga2Sampler {
    fn enqueue(&mut self, params: ParamSet) {
        self.queue.push_back(params);
    }

    fn propose(&mut self) -> ParamSet {
        if let Some(params) = self.queue.pop_front() {
            return params;
        }
        if self.history.len() < self.population_size() {
            return self.space.sample(&mut self.rng);
        }
        // A new generation starts every `population_size` reports.
        if self.parents.is_empty() || self.history.len() >= self.parents_built_at + self.population_size() {
            self.rebuild_parents();
        }
        if self.parents.is_empty() {
            return self.space.sample(&mut self.rng);
        }
        self.offspring()
    }

    fn report(&mut self, params: &ParamSet, outcome: Outcome<'_>) {
        self.history.push(Observation::new(params, outcome));
    }

    fn name(&self) -> &str {
        "nsga2"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{metric, ObjectiveSpec, ParamSpec, SamplerConfig};

    fn space(kind: SamplerKind) -> SearchSpace {
        SearchSpace::new(vec![
            ParamSpec::int("x", 0, 100, 1),
            ParamSpec::categorical("mode", &["a", "b"]),
        ])
        .with_objective(ObjectiveSpec::new(metric::NET_PROFIT_PCT))
        .with_sampler(SamplerConfig {
            kind,
            n_startup_trials: 5,
            population_size: 8,
            ..Default::default()
        })
    }

    fn score(params: &ParamSet) -> f64 {
        let x = params["x"].as_f64().unwrap_or(0.0);
        let bonus = if params["mode"].as_str() == Some("b") { 10.0 } else { 0.0 };
        -(x - 70.0).abs() + bonus
    }

    fn drive(sampler: &mut dyn Sampler, space: &SearchSpace, n: usize) -> Vec<ParamSet> {
        let mut proposed = Vec::new();
        for _ in 0..n {
            let params = sampler.propose();
            assert!(space.contains(&params));
            let values = [score(&params)];
            sampler.report(
                &params,
                Outcome {
                    values: Some(&values),
                    constraint_violations: Some(&[]),
                },
            );
            proposed.push(params);
        }
        proposed
    }

    #[test]
    fn test_enqueued_points_come_first() {
        for kind in [SamplerKind::Random, SamplerKind::Tpe, SamplerKind::Nsga2] {
            let space = space(kind);
            let mut sampler = build_sampler(&space, 1);
            let mut p = ParamSet::new();
            p.insert("x".into(), ParamValue::Int(3));
            p.insert("mode".into(), ParamValue::Categorical("a".into()));
            sampler.enqueue(p.clone());
            assert_eq!(sampler.propose(), p);
        }
    }

    #[test]
    fn test_samplers_are_deterministic() {
        for kind in [SamplerKind::Random, SamplerKind::Tpe, SamplerKind::Nsga2] {
            let space = space(kind);
            let a = drive(build_sampler(&space, 9).as_mut(), &space, 40);
            let b = drive(build_sampler(&space, 9).as_mut(), &space, 40);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_tpe_concentrates_near_optimum() {
        let space = space(SamplerKind::Tpe);
        let proposals = drive(build_sampler(&space, 3).as_mut(), &space, 120);
        let late: f64 = proposals[80..].iter().map(score).sum::<f64>() / 40.0;
        let early: f64 = proposals[..5].iter().map(score).sum::<f64>() / 5.0;
        assert!(late > early, "late {} early {}", late, early);
    }

    #[test]
    fn test_nsga2_survives_failed_and_infeasible() {
        let space = space(SamplerKind::Nsga2);
        let mut sampler = build_sampler(&space, 5);
        for i in 0..30 {
            let params = sampler.propose();
            assert!(space.contains(&params));
            let values = [score(&params)];
            let violations = [if i % 3 == 0 { 1.0 } else { -1.0 }];
            let outcome = if i % 5 == 0 {
                Outcome {
                    values: None,
                    constraint_violations: None,
                }
            } else {
                Outcome {
                    values: Some(&values),
                    constraint_violations: Some(&violations),
                }
            };
            sampler.report(&params, outcome);
        }
    }

    #[test]
    fn test_outcome_feasibility() {
        let ok = Outcome {
            values: Some(&[1.0]),
            constraint_violations: Some(&[0.0, -2.0]),
        };
        assert!(ok.is_feasible());
        let bad = Outcome {
            values: Some(&[1.0]),
            constraint_violations: Some(&[0.5]),
        };
        assert!(!bad.is_feasible());
        assert!((bad.total_violation() - 0.5).abs() < 1e-12);
    }
}

//! Ordering of completed trials by feasibility, Pareto membership and the
//! primary objective.
//!
//! Pareto membership is only ever computed among feasible trials, so an
//! infeasible trial can never sit in the Pareto group. The final order is:
//!
//! 1. feasible Pareto-optimal trials,
//! 2. feasible dominated trials,
//! 3. infeasible trials,
//!
//! each group sorted by the primary objective's direction with the trial
//! number as a stable tiebreak. Failed trials are never ranked.

use crate::space::{Direction, SearchSpace};
use crate::study::Trial;
use std::cmp::Ordering;

/// Whether objective vector `a` Pareto-dominates `b`.
pub fn dominates(directions: &[Direction], a: &[f64], b: &[f64]) -> bool {
    let mut strictly_better = false;
    for ((d, x), y) in directions.iter().zip(a).zip(b) {
        if d.is_better(*y, *x) {
            return false;
        }
        if d.is_better(*x, *y) {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Trial numbers of the Pareto front among feasible completed trials.
pub fn pareto_front(space: &SearchSpace, trials: &[Trial]) -> Vec<u64> {
    let directions = space.directions();
    let feasible: Vec<(&Trial, &Vec<f64>)> = trials
        .iter()
        .filter(|t| t.is_feasible())
        .filter_map(|t| t.values.as_ref().map(|v| (t, v)))
        .collect();

    let mut front: Vec<u64> = feasible
        .iter()
        .filter(|(_, a)| !feasible.iter().any(|(_, b)| dominates(&directions, b, a)))
        .map(|(t, _)| t.number)
        .collect();
    front.sort_unstable();
    front
}

fn primary_order(direction: Direction, index: usize, a: &Trial, b: &Trial) -> Ordering {
    let va = a.value(index).unwrap_or(f64::NAN);
    let vb = b.value(index).unwrap_or(f64::NAN);
    direction.best_first(va, vb).then(a.number.cmp(&b.number))
}

/// Rank completed trials, returning trial numbers best first.
pub fn rank_trials(space: &SearchSpace, trials: &[Trial]) -> Vec<u64> {
    let index = space.primary_index();
    let direction = space.primary().direction();
    let pareto = if space.is_multi_objective() {
        pareto_front(space, trials)
    } else {
        Vec::new()
    };

    let group = |t: &Trial| -> u8 {
        if !t.is_feasible() {
            2
        } else if space.is_multi_objective() && pareto.binary_search(&t.number).is_err() {
            1
        } else {
            0
        }
    };

    let mut completed: Vec<&Trial> = trials.iter().filter(|t| t.is_complete()).collect();
    completed.sort_by(|a, b| {
        group(a)
            .cmp(&group(b))
            .then_with(|| primary_order(direction, index, a, b))
    });
    completed.into_iter().map(|t| t.number).collect()
}

/// Fast non-dominated sort over objective vectors. Returns fronts of indices,
/// best front first.
pub fn non_dominated_sort(directions: &[Direction], points: &[&[f64]]) -> Vec<Vec<usize>> {
    let n = points.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    let mut fronts: Vec<Vec<usize>> = Vec::new();
    let mut current = Vec::new();

    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if dominates(directions, points[i], points[j]) {
                dominated_by[i].push(j);
            } else if dominates(directions, points[j], points[i]) {
                domination_count[i] += 1;
            }
        }
        if domination_count[i] == 0 {
            current.push(i);
        }
    }

    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        next.sort_unstable();
        fronts.push(std::mem::replace(&mut current, next));
    }
    fronts
}

/// Crowding distance of each member of one front (boundary points get infinity).
pub fn crowding_distance(points: &[&[f64]]) -> Vec<f64> {
    let n = points.len();
    let mut distance = vec![0.0; n];
    if n <= 2 {
        return vec![f64::INFINITY; n];
    }
    let dims = points[0].len();
    for d in 0..dims {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| points[*a][d].total_cmp(&points[*b][d]));
        let lo = points[order[0]][d];
        let hi = points[order[n - 1]][d];
        distance[order[0]] = f64::INFINITY;
        distance[order[n - 1]] = f64::INFINITY;
        let span = hi - lo;
        if span <= f64::EPSILON {
            continue;
        }
        for k in 1..n - 1 {
            distance[order[k]] += (points[order[k + 1]][d] - points[order[k - 1]][d]) / span;
        }
    }
    distance
}

//! Final out-of-sample test.
//!
//! Shares the holdout computation with the forward test but never re-ranks:
//! candidates keep the order of the stage they came from.

use super::forward_test::evaluate_holdout;
use super::{RankedCandidate, Scored, StageMetrics};
use crate::data::Period;
use crate::simulator::Backtester;
use crate::space::metric;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OosTestConfig {
    /// Length of the reserved tail in a standalone run. Inside a
    /// walk-forward window the window's OOS segment is used instead.
    pub period_days: u32,
    pub metric: String,
}

impl Default for OosTestConfig {
    fn default() -> Self {
        Self {
            period_days: 30,
            metric: metric::NET_PROFIT_PCT.to_string(),
        }
    }
}

pub(crate) fn evaluate(
    config: &OosTestConfig,
    upstream: &[RankedCandidate],
    top_k: usize,
    backtester: &Backtester,
    optimize: &Period<'_>,
    oos: &Period<'_>,
) -> Vec<Scored> {
    let is_days = optimize.days();
    upstream
        .iter()
        .take(top_k)
        .map(|entry| {
            let evaluation = evaluate_holdout(backtester, &entry.candidate, &config.metric, is_days, oos);
            Scored {
                entry: entry.clone(),
                score: evaluation.degradation,
                metrics: StageMetrics::OosTest(evaluation),
            }
        })
        .collect()
}

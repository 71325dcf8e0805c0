//! Sieve - parameter optimization and walk-forward analysis for trading
//! strategies.
//!
//! # Overview
//!
//! Sieve searches a declared parameter space for the assignments that make a
//! strategy simulator perform best, then tries hard to reject the ones that
//! only looked good by chance:
//!
//! - **Search space**: int, float and categorical parameters, one to six
//!   objectives, feasibility constraints
//! - **Coverage scheduling**: a deterministic, stratified Latin hypercube of
//!   starting points before adaptive sampling
//! - **Samplers**: random, TPE and NSGA-II behind one narrow trait
//! - **Orchestration**: single-process or multi-worker with a shared trial
//!   journal, trial/time/stagnation budgets and cooperative cancellation
//! - **Ranking**: Pareto front, non-dominated sorting, feasible before
//!   infeasible
//! - **Post-processing**: deflated Sharpe, forward test, stress test and OOS
//!   test, each recording how it re-ranked its inputs
//! - **Walk-forward analysis**: fixed or adaptive (CUSUM, drawdown,
//!   inactivity) OOS windows, stitched into one OOS equity curve
//!
//! The strategy itself is a black box implementing [`simulator::Simulator`];
//! metrics come from any [`simulator::MetricsCalculator`].
//!
//! # Quick Start
//!
//! ```no_run
//! use sieve::analytics::StandardMetrics;
//! use sieve::data::load_csv;
//! use sieve::orchestrator::{Budget, OrchestratorConfig, RunContext, TrialOrchestrator};
//! use sieve::simulator::{Backtester, SmaCrossSimulator};
//! use sieve::space::{ObjectiveSpec, ParamSpec, SearchSpace};
//! use std::sync::Arc;
//!
//! let space = SearchSpace::new(vec![
//!     ParamSpec::int("fast_period", 5, 30, 1),
//!     ParamSpec::int("slow_period", 40, 120, 5),
//! ])
//! .with_objective(ObjectiveSpec::new("sharpe_ratio"));
//!
//! let backtester = Backtester::new(
//!     Arc::new(SmaCrossSimulator::new(10_000.0)),
//!     Arc::new(StandardMetrics::default()),
//!     10_000.0,
//! );
//! let config = OrchestratorConfig::default().with_budget(Budget::trials(200));
//!
//! let bars = load_csv("data/sample.csv", &Default::default()).unwrap();
//! let run = TrialOrchestrator::new(space, config, backtester)
//!     .run(&bars, &RunContext::new())
//!     .unwrap();
//! println!("{}", run.summary());
//! ```

pub mod adaptive;
pub mod analytics;
pub mod config;
pub mod coverage;
pub mod data;
pub mod error;
pub mod export;
pub mod journal;
pub mod metadata;
pub mod objective;
pub mod orchestrator;
pub mod postprocess;
pub mod ranking;
pub mod sampler;
pub mod simulator;
pub mod space;
pub mod stitching;
pub mod study;
pub mod types;
pub mod walkforward;

pub use error::{OptimizeError, Result};
pub use orchestrator::{CancellationToken, OrchestratorConfig, RunContext, TrialOrchestrator};
pub use postprocess::{PostProcessChain, PostProcessConfig, PostProcessReport};
pub use simulator::{Backtester, MetricsCalculator, Simulator};
pub use space::{ParamSet, ParamSpec, ParamValue, SearchSpace};
pub use study::{OptimizationRun, Trial};
pub use types::{Bar, MetricMap, SimulationResult, Trade};
pub use walkforward::{WalkForwardAnalyzer, WalkForwardConfig, WalkForwardResult};

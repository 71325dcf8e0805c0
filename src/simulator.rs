//! Strategy simulator and metrics calculator contracts.
//!
//! Both collaborators are black boxes to the optimizer. They must be pure for
//! fixed inputs; any error they return, and any panic they raise, is confined
//! to the trial that triggered it by [`Backtester`].

use crate::error::{OptimizeError, Result};
use crate::space::{ParamSet, ParamValue};
use crate::types::{Bar, MetricMap, Side, SimulationResult, Trade};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Turns a dataset and a parameter assignment into trades and curves.
pub trait Simulator: Send + Sync {
    /// Simulate over `bars`. Bars before `warmup_index` only feed indicators;
    /// the returned curves start at `warmup_index`.
    fn simulate(&self, bars: &[Bar], params: &ParamSet, warmup_index: usize) -> Result<SimulationResult>;
}

impl<F> Simulator for F
where
    F: Fn(&[Bar], &ParamSet, usize) -> Result<SimulationResult> + Send + Sync,
{
    fn simulate(&self, bars: &[Bar], params: &ParamSet, warmup_index: usize) -> Result<SimulationResult> {
        self(bars, params, warmup_index)
    }
}

/// Turns a simulation result into a flat mapping of named metrics.
pub trait MetricsCalculator: Send + Sync {
    fn compute(&self, result: &SimulationResult, initial_balance: f64) -> Result<MetricMap>;
}

impl<F> MetricsCalculator for F
where
    F: Fn(&SimulationResult, f64) -> Result<MetricMap> + Send + Sync,
{
    fn compute(&self, result: &SimulationResult, initial_balance: f64) -> Result<MetricMap> {
        self(result, initial_balance)
    }
}

/// Simulation output together with its metrics.
#[derive(Debug, Clone)]
pub struct Backtest {
    pub result: SimulationResult,
    pub metrics: MetricMap,
}

/// Runs simulator and metrics calculator as one unit, converting panics into
/// errors.
#[derive(Clone)]
pub struct Backtester {
    simulator: Arc<dyn Simulator>,
    metrics: Arc<dyn MetricsCalculator>,
    initial_balance: f64,
}

impl std::fmt::Debug for Backtester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backtester")
            .field("initial_balance", &self.initial_balance)
            .finish_non_exhaustive()
    }
}

impl Backtester {
    pub fn new(simulator: Arc<dyn Simulator>, metrics: Arc<dyn MetricsCalculator>, initial_balance: f64) -> Self {
        Self {
            simulator,
            metrics,
            initial_balance,
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    /// Simulate and measure one parameter assignment.
    pub fn run(&self, bars: &[Bar], params: &ParamSet, warmup_index: usize) -> Result<Backtest> {
        let result = catch_unwind(AssertUnwindSafe(|| self.simulator.simulate(bars, params, warmup_index)))
            .map_err(|panic| OptimizeError::SimulationError(panic_message(panic)))??;
        let metrics = catch_unwind(AssertUnwindSafe(|| self.metrics.compute(&result, self.initial_balance)))
            .map_err(|panic| OptimizeError::MetricsError(panic_message(panic)))??;
        Ok(Backtest { result, metrics })
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Read an integer parameter, falling back to `default` when absent.
pub fn int_param(params: &ParamSet, name: &str, default: i64) -> Result<i64> {
    match params.get(name) {
        None => Ok(default),
        Some(ParamValue::Int(v)) => Ok(*v),
        Some(other) => Err(OptimizeError::SimulationError(format!(
            "parameter '{}' must be an integer, got {}",
            name, other
        ))),
    }
}

/// Trading direction of the reference simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    LongOnly,
    LongShort,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    side: Side,
    quantity: f64,
    entry_price: f64,
    entry_index: usize,
    entry_commission: f64,
}

/// Reference SMA crossover simulator.
///
/// # Parameters
/// - `fast_period`: fast moving average length (default 10)
/// - `slow_period`: slow moving average length (default 30)
/// - `direction`: `"long"` (default) or `"both"` to reverse into shorts
///
/// Goes fully invested at the close of a crossover bar and flattens on the
/// opposite crossover. Any open position is closed on the last bar.
#[derive(Debug, Clone)]
pub struct SmaCrossSimulator {
    pub initial_capital: f64,
    /// Commission as a fraction of traded notional, per side.
    pub commission_rate: f64,
}

impl Default for SmaCrossSimulator {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            commission_rate: 0.0,
        }
    }
}

impl SmaCrossSimulator {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            ..Default::default()
        }
    }

    pub fn with_commission(mut self, rate: f64) -> Self {
        self.commission_rate = rate;
        self
    }

    fn close(&self, position: OpenPosition, bar: &Bar, index: usize, bars: &[Bar], cash: &mut f64) -> Trade {
        let exit_commission = bar.close * position.quantity * self.commission_rate;
        let trade = Trade {
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            entry_time: bars[position.entry_index].timestamp,
            entry_index: position.entry_index,
            exit_price: bar.close,
            exit_time: bar.timestamp,
            exit_index: index,
            commission: position.entry_commission + exit_commission,
        };
        *cash += trade.gross_pnl() - exit_commission;
        trade
    }
}

fn rolling_sma(bars: &[Bar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    let mut sum = 0.0;
    for i in 0..bars.len() {
        sum += bars[i].close;
        if i >= period {
            sum -= bars[i - period].close;
        }
        if i + 1 >= period {
            out[i] = Some(sum / period as f64);
        }
    }
    out
}

impl Simulator for SmaCrossSimulator {
    fn simulate(&self, bars: &[Bar], params: &ParamSet, warmup_index: usize) -> Result<SimulationResult> {
        let fast = int_param(params, "fast_period", 10)?;
        let slow = int_param(params, "slow_period", 30)?;
        if fast < 1 || slow <= fast {
            return Err(OptimizeError::SimulationError(format!(
                "fast period ({}) must be positive and below slow period ({})",
                fast, slow
            )));
        }
        let mode = match params.get("direction").and_then(ParamValue::as_str) {
            None | Some("long") => Mode::LongOnly,
            Some("both") => Mode::LongShort,
            Some(other) => {
                return Err(OptimizeError::SimulationError(format!("unknown direction '{}'", other)))
            }
        };
        if warmup_index >= bars.len() {
            return Ok(SimulationResult::default());
        }

        let fast_ma = rolling_sma(bars, fast as usize);
        let slow_ma = rolling_sma(bars, slow as usize);

        let mut cash = self.initial_capital;
        let mut position: Option<OpenPosition> = None;
        let mut result = SimulationResult::default();

        for i in warmup_index..bars.len() {
            let bar = &bars[i];
            let cross = match (i.checked_sub(1), fast_ma[i], slow_ma[i]) {
                (Some(prev), Some(f), Some(s)) => match (fast_ma[prev], slow_ma[prev]) {
                    (Some(pf), Some(ps)) if pf <= ps && f > s => Some(Side::Buy),
                    (Some(pf), Some(ps)) if pf >= ps && f < s => Some(Side::Sell),
                    _ => None,
                },
                _ => None,
            };

            if let Some(signal) = cross {
                if let Some(open) = position.take() {
                    if open.side != signal {
                        let trade = self.close(open, bar, i, bars, &mut cash);
                        result.trades.push(trade);
                    } else {
                        position = Some(open);
                    }
                }
                let may_open = signal == Side::Buy || mode == Mode::LongShort;
                if position.is_none() && may_open && i + 1 < bars.len() && cash > 0.0 {
                    let quantity = cash / (bar.close * (1.0 + self.commission_rate));
                    let entry_commission = bar.close * quantity * self.commission_rate;
                    cash -= entry_commission;
                    position = Some(OpenPosition {
                        side: signal,
                        quantity,
                        entry_price: bar.close,
                        entry_index: i,
                        entry_commission,
                    });
                }
            }

            if i + 1 == bars.len() {
                if let Some(open) = position.take() {
                    let trade = self.close(open, bar, i, bars, &mut cash);
                    result.trades.push(trade);
                }
            }

            let unrealized = position
                .as_ref()
                .map(|p| {
                    let direction = if p.side == Side::Buy { 1.0 } else { -1.0 };
                    direction * (bar.close - p.entry_price) * p.quantity
                })
                .unwrap_or(0.0);
            result.equity_curve.push(cash + unrealized);
            result.balance_curve.push(cash);
            result.timestamps.push(bar.timestamp);
        }

        Ok(result)
    }
}

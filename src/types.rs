//! Core data types shared by the optimizer and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Flat mapping of metric name to value produced by a metrics calculator.
///
/// A metric that could not be computed is either absent or NaN; both are
/// treated as non-finite by the evaluator.
pub type MetricMap = BTreeMap<String, f64>;

/// Serde adapter for [`MetricMap`] that keeps non-finite values.
///
/// JSON has no NaN or infinity, so those are written as the strings `"NaN"`,
/// `"inf"` and `"-inf"`. A `null` reads back as NaN.
pub mod metric_map_serde {
    use super::MetricMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(map: &MetricMap, serializer: S) -> Result<S::Ok, S::Error> {
        let repr: BTreeMap<&str, Repr> = map.iter().map(|(k, v)| (k.as_str(), encode(*v))).collect();
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MetricMap, D::Error> {
        let repr: BTreeMap<String, Option<Repr>> = BTreeMap::deserialize(deserializer)?;
        Ok(repr.into_iter().map(|(k, v)| (k, decode(v))).collect())
    }

    fn encode(value: f64) -> Repr {
        if value.is_finite() {
            Repr::Number(value)
        } else if value.is_nan() {
            Repr::Text("NaN".to_string())
        } else if value > 0.0 {
            Repr::Text("inf".to_string())
        } else {
            Repr::Text("-inf".to_string())
        }
    }

    fn decode(repr: Option<Repr>) -> f64 {
        match repr {
            Some(Repr::Number(v)) => v,
            Some(Repr::Text(t)) => match t.as_str() {
                "inf" | "+inf" | "Infinity" => f64::INFINITY,
                "-inf" | "-Infinity" => f64::NEG_INFINITY,
                _ => f64::NAN,
            },
            None => f64::NAN,
        }
    }
}

/// OHLCV bar representing a single time period of market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate that bar data is consistent.
    pub fn validate(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }
}

/// Trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A closed round-trip trade reported by a simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_index: usize,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_index: usize,
    pub commission: f64,
}

impl Trade {
    /// Gross P&L before costs.
    pub fn gross_pnl(&self) -> f64 {
        let direction = match self.side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        direction * (self.exit_price - self.entry_price) * self.quantity
    }

    /// Net P&L after commission.
    pub fn net_pnl(&self) -> f64 {
        self.gross_pnl() - self.commission
    }

    /// Return of the trade as a percentage of the entry notional.
    pub fn return_pct(&self) -> f64 {
        let notional = self.entry_price * self.quantity;
        if notional.abs() < f64::EPSILON {
            return 0.0;
        }
        self.net_pnl() / notional * 100.0
    }
}

/// Output of a strategy simulation over one contiguous slice of bars.
///
/// `equity_curve`, `balance_curve` and `timestamps` are aligned and start at
/// the simulation's warmup index; bars before it only feed indicators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<f64>,
    pub balance_curve: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
}

impl SimulationResult {
    /// Number of evaluated bars.
    pub fn len(&self) -> usize {
        self.equity_curve.len()
    }

    /// Whether the simulation produced no evaluated bars.
    pub fn is_empty(&self) -> bool {
        self.equity_curve.is_empty()
    }

    /// Per-bar simple returns of the equity curve.
    pub fn returns(&self) -> Vec<f64> {
        self.equity_curve
            .windows(2)
            .map(|w| if w[0].abs() > f64::EPSILON { w[1] / w[0] - 1.0 } else { 0.0 })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_bar_validation() {
        let valid_bar = Bar::new(sample_timestamp(), 100.0, 105.0, 98.0, 102.0, 1000.0);
        assert!(valid_bar.validate());

        let invalid_bar = Bar::new(sample_timestamp(), 100.0, 95.0, 98.0, 102.0, 1000.0);
        assert!(!invalid_bar.validate());

        let invalid_bar2 = Bar::new(sample_timestamp(), 100.0, 105.0, 98.0, 102.0, -100.0);
        assert!(!invalid_bar2.validate());
    }

    #[test]
    fn test_trade_pnl() {
        let trade = Trade {
            side: Side::Buy,
            quantity: 100.0,
            entry_price: 150.0,
            entry_time: sample_timestamp(),
            entry_index: 0,
            exit_price: 160.0,
            exit_time: Utc.with_ymd_and_hms(2024, 1, 16, 9, 30, 0).unwrap(),
            exit_index: 1,
            commission: 2.0,
        };

        assert!((trade.gross_pnl() - 1000.0).abs() < f64::EPSILON);
        assert!((trade.net_pnl() - 998.0).abs() < f64::EPSILON);
        assert!((trade.return_pct() - 998.0 / 15_000.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_trade_short_pnl() {
        let trade = Trade {
            side: Side::Sell,
            quantity: 100.0,
            entry_price: 160.0,
            entry_time: sample_timestamp(),
            entry_index: 0,
            exit_price: 150.0,
            exit_time: Utc.with_ymd_and_hms(2024, 1, 16, 9, 30, 0).unwrap(),
            exit_index: 1,
            commission: 0.0,
        };

        assert!((trade.gross_pnl() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_simulation_returns() {
        let result = SimulationResult {
            equity_curve: vec![100.0, 110.0, 99.0],
            ..Default::default()
        };
        let returns = result.returns();
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.1).abs() < 1e-12);
        assert!((returns[1] + 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_metric_map_keeps_non_finite() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            #[serde(with = "metric_map_serde")]
            metrics: MetricMap,
        }
        let mut metrics = MetricMap::new();
        metrics.insert("a".into(), 1.5);
        metrics.insert("b".into(), f64::NAN);
        metrics.insert("c".into(), f64::INFINITY);
        let json = serde_json::to_string(&Holder { metrics }).unwrap();
        assert!(json.contains("\"inf\""));

        let back: Holder = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metrics["a"], 1.5);
        assert!(back.metrics["b"].is_nan());
        assert_eq!(back.metrics["c"], f64::INFINITY);

        let from_null: Holder = serde_json::from_str(r#"{"metrics":{"x":null}}"#).unwrap();
        assert!(from_null.metrics["x"].is_nan());
    }
}

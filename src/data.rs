//! Market data loading and period boundary resolution.
//!
//! Every period boundary is resolved at full timestamp resolution. A
//! boundary given as a plain date is never truncated to midnight when it
//! closes a period: it is aligned to the last available bar of that date.

use crate::error::{OptimizeError, Result};
use crate::types::Bar;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Raw CSV row with flexible column names.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(
        alias = "Date",
        alias = "DATE",
        alias = "Timestamp",
        alias = "timestamp",
        alias = "Time",
        alias = "time",
        alias = "datetime",
        alias = "Datetime"
    )]
    date: String,
    #[serde(alias = "Open", alias = "o")]
    open: f64,
    #[serde(alias = "High", alias = "h")]
    high: f64,
    #[serde(alias = "Low", alias = "l")]
    low: f64,
    #[serde(alias = "Close", alias = "c", alias = "Adj Close")]
    close: f64,
    #[serde(alias = "Volume", alias = "v", alias = "vol", alias = "Vol", default)]
    volume: f64,
}

/// CSV loading options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Explicit date format (e.g. `"%Y-%m-%d %H:%M:%S"`); auto-detected otherwise.
    pub date_format: Option<String>,
    pub has_headers: bool,
    /// CSV delimiter. Auto-detected when `None`.
    pub delimiter: Option<u8>,
    /// Skip invalid rows instead of failing.
    pub skip_invalid: bool,
    /// Reject bars with inconsistent OHLC values.
    pub validate_bars: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            has_headers: true,
            delimiter: None,
            skip_invalid: true,
            validate_bars: true,
        }
    }
}

/// Pick the delimiter giving a consistent column count of at least five.
fn detect_delimiter(sample: &[String]) -> u8 {
    let delimiters = [b',', b'\t', b';', b'|'];
    let mut best = (b',', 0usize);
    for &delim in &delimiters {
        let counts: Vec<usize> = sample
            .iter()
            .map(|line| line.as_bytes().iter().filter(|&&b| b == delim).count() + 1)
            .collect();
        let Some(&first) = counts.first() else {
            continue;
        };
        if first >= 5 && counts.iter().all(|&c| c == first) && first > best.1 {
            best = (delim, first);
        }
    }
    debug!("Detected delimiter {:?}", best.0 as char);
    best.0
}

const DATETIME_FORMATS: [&str; 9] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: [&str; 6] = ["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y", "%d-%b-%Y", "%b %d, %Y"];

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Parse a bar timestamp with multiple format attempts.
pub fn parse_datetime(s: &str, format: Option<&str>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(midnight(d));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in &DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }
    for fmt in &DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(midnight(d));
        }
    }
    if let Ok(ts) = s.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(ts, 0) {
            return Ok(dt);
        }
    }
    Err(OptimizeError::DataError(format!("Could not parse date: '{}'", s)))
}

fn read_bars<R: Read>(reader: R, delimiter: u8, config: &DataConfig) -> Result<Vec<Bar>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(config.has_headers)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(reader);

    let mut bars = Vec::new();
    let mut skipped = 0;

    for (row_num, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = match result {
            Ok(r) => r,
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {}: {}", row_num + 1, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let timestamp = match parse_datetime(&row.date, config.date_format.as_deref()) {
            Ok(ts) => ts,
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {} due to date parse error: {}", row_num + 1, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        let bar = Bar::new(timestamp, row.open, row.high, row.low, row.close, row.volume);
        if config.validate_bars && !bar.validate() {
            if config.skip_invalid {
                skipped += 1;
                continue;
            }
            return Err(OptimizeError::DataError(format!(
                "Invalid bar data at row {}: {:?}",
                row_num + 1,
                bar
            )));
        }
        bars.push(bar);
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }

    bars.sort_by_key(|b| b.timestamp);
    let original_len = bars.len();
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() < original_len {
        warn!("Removed {} duplicate timestamps", original_len - bars.len());
    }

    if bars.is_empty() {
        return Err(OptimizeError::DataError("no valid bars found".to_string()));
    }
    Ok(bars)
}

/// Load OHLCV bars from a CSV file.
pub fn load_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    info!("Loading data from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => {
            let sample: Vec<String> = BufReader::new(File::open(path)?)
                .lines()
                .take(5)
                .collect::<std::io::Result<_>>()?;
            detect_delimiter(&sample)
        }
    };

    let bars = read_bars(File::open(path)?, delimiter, config)?;
    info!(
        "Loaded {} bars from {} to {}",
        bars.len(),
        bars[0].timestamp,
        bars[bars.len() - 1].timestamp
    );
    Ok(bars)
}

/// Load OHLCV bars from in-memory CSV text.
pub fn load_csv_str(content: &str, config: &DataConfig) -> Result<Vec<Bar>> {
    let delimiter = match config.delimiter {
        Some(d) => d,
        None => {
            let sample: Vec<String> = content.lines().take(5).map(str::to_string).collect();
            detect_delimiter(&sample)
        }
    };
    read_bars(content.as_bytes(), delimiter, config)
}

/// A user-supplied period boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// An exact instant.
    Instant(DateTime<Utc>),
    /// A calendar date without a time component.
    Date(NaiveDate),
}

/// Parse a boundary string, keeping full resolution when a time is given.
pub fn parse_boundary(s: &str) -> Result<Boundary> {
    let s = s.trim();
    for fmt in &DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(Boundary::Date(d));
        }
    }
    parse_datetime(s, None).map(Boundary::Instant)
}

/// Index of the first bar at or after `ts`.
pub fn index_at_or_after(bars: &[Bar], ts: DateTime<Utc>) -> usize {
    bars.partition_point(|b| b.timestamp < ts)
}

/// Index of the last bar at or before `ts`, if any.
pub fn index_at_or_before(bars: &[Bar], ts: DateTime<Utc>) -> Option<usize> {
    bars.partition_point(|b| b.timestamp <= ts).checked_sub(1)
}

/// Resolve a boundary opening a period to a bar index.
pub fn resolve_start(bars: &[Bar], boundary: Boundary) -> usize {
    match boundary {
        Boundary::Instant(ts) => index_at_or_after(bars, ts),
        Boundary::Date(d) => index_at_or_after(bars, midnight(d)),
    }
}

/// Resolve a boundary closing a period to a bar index. A date-only boundary
/// resolves to the last bar of that date.
pub fn resolve_end(bars: &[Bar], boundary: Boundary) -> Option<usize> {
    match boundary {
        Boundary::Instant(ts) => index_at_or_before(bars, ts),
        Boundary::Date(d) => {
            let next_day = d.succ_opt().map(midnight)?;
            bars.partition_point(|b| b.timestamp < next_day).checked_sub(1)
        }
    }
}

/// Slice bars to the inclusive range between two optional boundaries.
pub fn slice_range(bars: &[Bar], start: Option<Boundary>, end: Option<Boundary>) -> Result<&[Bar]> {
    let from = start.map(|b| resolve_start(bars, b)).unwrap_or(0);
    let to = match end {
        Some(b) => resolve_end(bars, b),
        None => bars.len().checked_sub(1),
    };
    match to {
        Some(to) if to >= from && from < bars.len() => Ok(&bars[from..=to]),
        _ => Err(OptimizeError::DataError(format!(
            "no bars between {:?} and {:?}",
            start, end
        ))),
    }
}

/// A contiguous evaluation slice plus the bars before it that only warm up
/// indicators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Period<'a> {
    bars: &'a [Bar],
    warmup: usize,
}

impl<'a> Period<'a> {
    /// The whole slice, with its first `warmup` bars reserved for warmup.
    pub fn new(bars: &'a [Bar], warmup: usize) -> Self {
        Self {
            bars,
            warmup: warmup.min(bars.len()),
        }
    }

    /// Bars `start..end` of `all`, preceded by up to `lookback` earlier bars.
    pub fn with_lookback(all: &'a [Bar], start: usize, end: usize, lookback: usize) -> Self {
        let end = end.min(all.len());
        let start = start.min(end);
        let from = start.saturating_sub(lookback);
        Self {
            bars: &all[from..end],
            warmup: start - from,
        }
    }

    /// Bars handed to the simulator, warmup included.
    pub fn bars(&self) -> &'a [Bar] {
        self.bars
    }

    pub fn warmup(&self) -> usize {
        self.warmup
    }

    /// Bars that are actually evaluated.
    pub fn eval_bars(&self) -> &'a [Bar] {
        &self.bars[self.warmup..]
    }

    pub fn is_empty(&self) -> bool {
        self.eval_bars().is_empty()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.eval_bars().first().map(|b| b.timestamp)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.eval_bars().last().map(|b| b.timestamp)
    }

    /// Calendar span of the evaluated bars in (fractional) days.
    pub fn days(&self) -> f64 {
        match (self.start(), self.end()) {
            (Some(start), Some(end)) => (end - start).num_seconds() as f64 / 86_400.0,
            _ => 0.0,
        }
    }
}

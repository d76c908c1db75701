/// Core type definitions for the aggregation pipeline
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Aggregation granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    FiveMinute,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::FiveMinute => "5m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
        }
    }

    /// Source tag stored on every bar of this timeframe
    pub fn source(&self) -> &'static str {
        match self {
            Timeframe::FiveMinute => "raw-5m",
            Timeframe::OneHour => "agg-1h",
            Timeframe::FourHour => "agg-4h",
            Timeframe::OneDay => "agg-1d",
        }
    }

    pub fn from_source(source: &str) -> Option<Self> {
        Self::all().into_iter().find(|tf| tf.source() == source)
    }

    pub fn duration_minutes(&self) -> i64 {
        match self {
            Timeframe::FiveMinute => 5,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1440, // 24 * 60
        }
    }

    /// Derived timeframes are built by the aggregator from raw 5m bars
    pub fn is_derived(&self) -> bool {
        !matches!(self, Timeframe::FiveMinute)
    }

    pub fn all() -> Vec<Timeframe> {
        vec![
            Timeframe::FiveMinute,
            Timeframe::OneHour,
            Timeframe::FourHour,
            Timeframe::OneDay,
        ]
    }

    pub fn derived() -> Vec<Timeframe> {
        vec![Timeframe::OneHour, Timeframe::FourHour, Timeframe::OneDay]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "5m" | "raw-5m" => Ok(Timeframe::FiveMinute),
            "1h" | "agg-1h" => Ok(Timeframe::OneHour),
            "4h" | "agg-4h" => Ok(Timeframe::FourHour),
            "1d" | "agg-1d" => Ok(Timeframe::OneDay),
            other => Err(PipelineError::Config(format!("Unknown timeframe: {}", other))),
        }
    }
}

/// OHLCV bar as persisted in the bar store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub id: String,
    pub pair: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    #[serde(default)]
    pub quality_degraded: bool,
    #[serde(default)]
    pub calculated: bool,
    #[serde(default)]
    pub calculated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub calculated_version: u32,
}

impl Bar {
    /// Build an uncalculated bar; the id is derived from the unique key
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: &str,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: i64,
    ) -> Self {
        let source = timeframe.source();
        Bar {
            id: bar_id(pair, timestamp, source),
            pair: pair.to_string(),
            source: source.to_string(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            quality_degraded: false,
            calculated: false,
            calculated_at: None,
            calculated_version: 0,
        }
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        Timeframe::from_source(&self.source)
    }

    /// Clamp high/low to the open/close envelope. Returns true if anything changed.
    pub fn enforce_envelope(&mut self) -> bool {
        let top = self.open.max(self.close);
        let bottom = self.open.min(self.close);
        let mut corrected = false;

        if self.high < top {
            self.high = top;
            corrected = true;
        }
        if self.low > bottom {
            self.low = bottom;
            corrected = true;
        }

        corrected
    }

    pub fn satisfies_envelope(&self) -> bool {
        self.high >= self.open.max(self.close) && self.low <= self.open.min(self.close)
    }

    /// Same market data, ignoring calculation state
    pub fn same_ohlcv(&self, other: &Bar) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.quality_degraded == other.quality_degraded
    }

    /// Calculated at (or beyond) the target indicator version
    pub fn is_current(&self, target_version: u32) -> bool {
        self.calculated && self.calculated_version >= target_version
    }

    pub fn clear_calculation(&mut self) {
        self.calculated = false;
        self.calculated_at = None;
        self.calculated_version = 0;
    }
}

/// Deterministic id for the (pair, timestamp, source) key
pub fn bar_id(pair: &str, timestamp: DateTime<Utc>, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pair.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Raw OHLCV row from the fetcher. Prices may be missing upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub timestamp: DateTime<Utc>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<i64>,
}

/// Indicator values computed for one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub pair: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub values: BTreeMap<String, f64>,
    pub computed_at: DateTime<Utc>,
}

/// Live backlog counters for one timeframe (or the whole pair)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogSnapshot {
    pub total: usize,
    pub calculated: usize,
    pub uncalculated: usize,
    pub progress_percent: f64,
}

impl BacklogSnapshot {
    pub fn new(total: usize, calculated: usize) -> Self {
        let calculated = calculated.min(total);
        let progress_percent = if total == 0 {
            100.0
        } else {
            (calculated as f64 / total as f64) * 100.0
        };

        BacklogSnapshot {
            total,
            calculated,
            uncalculated: total - calculated,
            progress_percent,
        }
    }

    pub fn merge(&self, other: &BacklogSnapshot) -> BacklogSnapshot {
        BacklogSnapshot::new(self.total + other.total, self.calculated + other.calculated)
    }
}

/// Backlog report across all timeframes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogStatus {
    pub pair: String,
    pub target_version: u32,
    pub generated_at: DateTime<Utc>,
    pub timeframes: BTreeMap<Timeframe, BacklogSnapshot>,
    pub overall: BacklogSnapshot,
}

/// Which timeframes an administrative reset applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    Timeframe(Timeframe),
    All,
}

impl ResetScope {
    pub fn timeframes(&self) -> Vec<Timeframe> {
        match self {
            ResetScope::Timeframe(tf) => vec![*tf],
            ResetScope::All => Timeframe::all(),
        }
    }
}

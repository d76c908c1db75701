/// Typed pipeline configuration with documented defaults
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::types::Timeframe;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Instrument handled by this process
    pub pair: String,

    /// IANA timezone used to align 4h and 1d windows
    pub reference_timezone: String,

    // Logging
    pub log_level: String,
    pub log_json: bool,

    pub scheduler: SchedulerSettings,
    pub aggregation: AggregationSettings,
    pub indicators: IndicatorSettings,
    pub fetcher: FetcherSettings,
    pub store: StoreSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            pair: "EURUSD".to_string(),
            reference_timezone: "UTC".to_string(),
            log_level: "candleflow=info,info".to_string(),
            log_json: false,
            scheduler: SchedulerSettings::default(),
            aggregation: AggregationSettings::default(),
            indicators: IndicatorSettings::default(),
            fetcher: FetcherSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn timezone(&self) -> Result<Tz> {
        self.reference_timezone.parse::<Tz>().map_err(|e| {
            PipelineError::Config(format!(
                "Invalid reference_timezone {}: {}",
                self.reference_timezone, e
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub interval_minutes: u64,
    /// Fetch attempts per cycle before the cycle is declared failed
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    /// Network and rate-limit failures wait `retry_delay_seconds * multiplier`
    pub network_backoff_multiplier: u32,
    pub max_consecutive_failures: u32,
    /// Health reports `degraded` from this many consecutive failures on
    pub degraded_after_failures: u32,
    /// History fetched once on start; `None` disables bootstrap
    pub bootstrap_period: Option<String>,
    /// History fetched when the latest raw bar skips ahead of the store
    pub gap_fill_period: String,
    /// Number of cycle durations kept for the rolling average
    pub stats_window: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            interval_minutes: 5,
            max_retries: 3,
            retry_delay_seconds: 30,
            network_backoff_multiplier: 2,
            max_consecutive_failures: 5,
            degraded_after_failures: 1,
            bootstrap_period: Some("5d".to_string()),
            gap_fill_period: "1d".to_string(),
            stats_window: 20,
        }
    }
}

/// What to do with a window whose constituent gap exceeds `max_gap_minutes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Write the bar and flag it quality-degraded
    Lenient,
    /// Do not write the bar
    Strict,
}

/// Quality gate for one target timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationWindow {
    pub min_data_points: usize,
    pub max_gap_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub gap_policy: GapPolicy,
    /// Closed windows recomputed per cycle, counting back from the latest
    pub recompute_windows: usize,
    pub one_hour: AggregationWindow,
    pub four_hour: AggregationWindow,
    pub one_day: AggregationWindow,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        AggregationSettings {
            gap_policy: GapPolicy::Lenient,
            recompute_windows: 1,
            one_hour: AggregationWindow {
                min_data_points: 10,
                max_gap_minutes: 15,
            },
            four_hour: AggregationWindow {
                min_data_points: 40,
                max_gap_minutes: 30,
            },
            one_day: AggregationWindow {
                min_data_points: 200,
                max_gap_minutes: 60,
            },
        }
    }
}

impl AggregationSettings {
    pub fn window(&self, timeframe: Timeframe) -> Option<AggregationWindow> {
        match timeframe {
            Timeframe::FiveMinute => None,
            Timeframe::OneHour => Some(self.one_hour),
            Timeframe::FourHour => Some(self.four_hour),
            Timeframe::OneDay => Some(self.one_day),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Rsi,
    Ema,
    Sma,
    Atr,
    Adx,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::Ema => "ema",
            IndicatorKind::Sma => "sma",
            IndicatorKind::Atr => "atr",
            IndicatorKind::Adx => "adx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub kind: IndicatorKind,
    pub period: usize,
}

impl IndicatorSpec {
    pub fn new(kind: IndicatorKind, period: usize) -> Self {
        IndicatorSpec { kind, period }
    }

    /// Stored value name, e.g. `rsi_14`
    pub fn name(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.period)
    }

    /// Bars of history required before the bar being computed
    pub fn lookback(&self) -> usize {
        match self.kind {
            IndicatorKind::Rsi | IndicatorKind::Atr => self.period,
            IndicatorKind::Ema | IndicatorKind::Sma => self.period.saturating_sub(1),
            IndicatorKind::Adx => self.period * 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorSettings {
    /// Bump to force recomputation of every bar
    pub version: u32,
    /// Bars pulled from the backlog per timeframe per cycle
    pub batch_size: usize,
    pub specs: Vec<IndicatorSpec>,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        IndicatorSettings {
            version: 1,
            batch_size: 500,
            specs: vec![
                IndicatorSpec::new(IndicatorKind::Rsi, 14),
                IndicatorSpec::new(IndicatorKind::Ema, 20),
                IndicatorSpec::new(IndicatorKind::Sma, 50),
                IndicatorSpec::new(IndicatorKind::Atr, 14),
                IndicatorSpec::new(IndicatorKind::Adx, 14),
            ],
        }
    }
}

impl IndicatorSettings {
    /// Longest history requirement across the configured indicators
    pub fn max_lookback(&self) -> usize {
        self.specs.iter().map(IndicatorSpec::lookback).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    pub base_url: String,
    pub requests_per_second: u32,
    pub timeout_seconds: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        FetcherSettings {
            base_url: "http://127.0.0.1:8080".to_string(),
            requests_per_second: 2,
            timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Append-only JSONL log backing the bar store
    pub path: String,
    /// Log length below which the store never compacts itself
    pub compact_min_ops: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            path: "data/bars.jsonl".to_string(),
            compact_min_ops: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lookback_is_longest_indicator() {
        let settings = IndicatorSettings::default();
        // SMA 50 needs 49 prior bars, ADX 14 needs 28
        assert_eq!(settings.max_lookback(), 49);
    }

    #[test]
    fn test_rsi_lookback_matches_period() {
        let spec = IndicatorSpec::new(IndicatorKind::Rsi, 14);
        assert_eq!(spec.lookback(), 14);
        assert_eq!(spec.name(), "rsi_14");
    }

    #[test]
    fn test_aggregation_window_per_timeframe() {
        let settings = AggregationSettings::default();
        assert!(settings.window(Timeframe::FiveMinute).is_none());
        assert_eq!(settings.window(Timeframe::OneHour).unwrap().min_data_points, 10);
    }

    #[test]
    fn test_timezone_parsing() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.timezone().unwrap(), chrono_tz::UTC);

        config.reference_timezone = "Mars/Olympus".to_string();
        assert!(config.timezone().is_err());
    }
}

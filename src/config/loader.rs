/// Configuration loading: optional TOML file layered with environment overrides
use std::path::Path;

use config::{Environment, File, FileFormat};

use crate::config::settings::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::time::parse_period;

/// Environment overrides use this prefix, e.g. `CANDLEFLOW__SCHEDULER__RETRY_DELAY_SECONDS=10`
pub const ENV_PREFIX: &str = "CANDLEFLOW";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let path = path.as_ref();

    let settings = config::Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: PipelineConfig = settings
        .try_deserialize()
        .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

/// Parse configuration from a TOML string (no environment layering)
pub fn config_from_toml(content: &str) -> Result<PipelineConfig> {
    let settings = config::Config::builder()
        .add_source(File::from_str(content, FileFormat::Toml))
        .build()?;

    let config: PipelineConfig = settings
        .try_deserialize()
        .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.pair.trim().is_empty() {
        return Err(PipelineError::Config("pair is empty".to_string()));
    }

    config.timezone()?;

    // Scheduler
    let scheduler = &config.scheduler;
    if scheduler.interval_minutes == 0 {
        return Err(PipelineError::Config("interval_minutes must be > 0".to_string()));
    }
    if scheduler.max_retries == 0 {
        return Err(PipelineError::Config("max_retries must be >= 1".to_string()));
    }
    if scheduler.max_consecutive_failures == 0 {
        return Err(PipelineError::Config(
            "max_consecutive_failures must be >= 1".to_string(),
        ));
    }
    if scheduler.network_backoff_multiplier == 0 {
        return Err(PipelineError::Config(
            "network_backoff_multiplier must be >= 1".to_string(),
        ));
    }
    if let Some(period) = &scheduler.bootstrap_period {
        parse_period(period)?;
    }
    parse_period(&scheduler.gap_fill_period)?;

    // Aggregation windows
    for (name, window) in [
        ("one_hour", config.aggregation.one_hour),
        ("four_hour", config.aggregation.four_hour),
        ("one_day", config.aggregation.one_day),
    ] {
        if window.min_data_points == 0 {
            return Err(PipelineError::Config(format!(
                "{}.min_data_points must be >= 1",
                name
            )));
        }
        if window.max_gap_minutes < 5 {
            return Err(PipelineError::Config(format!(
                "{}.max_gap_minutes must be >= 5",
                name
            )));
        }
    }

    // Indicators
    let indicators = &config.indicators;
    if indicators.version == 0 {
        return Err(PipelineError::Config("indicators.version must be >= 1".to_string()));
    }
    if indicators.batch_size == 0 {
        return Err(PipelineError::Config("indicators.batch_size must be >= 1".to_string()));
    }
    if indicators.batch_size <= indicators.max_lookback() {
        return Err(PipelineError::Config(format!(
            "indicators.batch_size ({}) must exceed the longest lookback ({})",
            indicators.batch_size,
            indicators.max_lookback()
        )));
    }
    if let Some(spec) = indicators.specs.iter().find(|s| s.period < 2) {
        return Err(PipelineError::Config(format!(
            "Indicator {} period must be >= 2",
            spec.name()
        )));
    }

    Ok(())
}

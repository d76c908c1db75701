/// Rebuild derived bars from stored 5m history
///
/// Usage: backfill_aggregates <1h|4h|1d|all> <days>
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Duration;
use tracing::info;

use candleflow::{
    config::load_config,
    data::{Aggregator, JsonlBarStore},
    time::{Clock, SystemClock},
    utils::init_tracing,
    Timeframe,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path)?;
    init_tracing(&config.log_level, config.log_json);

    let mut args = std::env::args().skip(1);
    let target = args.next().unwrap_or_else(|| "all".to_string());
    let days: i64 = args
        .next()
        .unwrap_or_else(|| "7".to_string())
        .parse()
        .context("days must be an integer")?;
    if days <= 0 {
        bail!("days must be positive");
    }

    let timeframes = if target.eq_ignore_ascii_case("all") {
        Timeframe::derived()
    } else {
        let timeframe: Timeframe = target.parse()?;
        if !timeframe.is_derived() {
            bail!("{} bars are fetched, not aggregated", timeframe);
        }
        vec![timeframe]
    };

    let store = Arc::new(JsonlBarStore::open(&config.store.path).await?);
    let clock = Arc::new(SystemClock);
    let aggregator = Aggregator::new(
        config.pair.clone(),
        store.clone(),
        clock.clone(),
        config.aggregation.clone(),
        config.timezone()?,
    );

    let end = clock.now();
    let start = end - Duration::days(days);
    for timeframe in timeframes {
        let bars = aggregator.backfill(timeframe, start, end).await?;
        let degraded = bars.iter().filter(|b| b.quality_degraded).count();
        info!(
            "Rebuilt {} {} bars for {} ({} quality-degraded)",
            bars.len(),
            timeframe,
            config.pair,
            degraded
        );
    }

    store.compact().await?;
    Ok(())
}

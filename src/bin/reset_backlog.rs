/// Clear calculation flags so indicators are recomputed
///
/// Usage: reset_backlog [5m|1h|4h|1d|all]
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use candleflow::{
    config::load_config,
    data::{BacklogTracker, JsonlBarStore},
    time::SystemClock,
    utils::init_tracing,
    ResetScope, Timeframe,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path)?;
    init_tracing(&config.log_level, config.log_json);

    let arg = std::env::args().nth(1).unwrap_or_else(|| "all".to_string());
    let scope = if arg.eq_ignore_ascii_case("all") {
        ResetScope::All
    } else {
        let timeframe: Timeframe = arg
            .parse()
            .with_context(|| format!("expected a timeframe or `all`, got {}", arg))?;
        ResetScope::Timeframe(timeframe)
    };

    let store = Arc::new(JsonlBarStore::open(&config.store.path).await?);
    let tracker = BacklogTracker::new(
        config.pair.clone(),
        store.clone(),
        Arc::new(SystemClock),
        config.indicators.version,
        config.indicators.batch_size,
    );

    let cleared = tracker.reset(scope).await?;
    store.compact().await?;

    info!("Cleared {} bars for {} ({})", cleared, config.pair, arg);
    println!("{}", serde_json::to_string_pretty(&tracker.get_status().await?)?);

    Ok(())
}

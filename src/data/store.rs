/// Bar store interface shared by the aggregator, backlog tracker and indicator computer
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::types::{Bar, IndicatorRecord, Timeframe};

/// Persistence for bars keyed by (pair, timestamp, source).
///
/// Range queries are half-open `[start, end)` and return bars in ascending
/// timestamp order.
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert or overwrite the bar with the same unique key
    async fn save(&self, bar: Bar) -> Result<Bar>;

    async fn find_by_range(
        &self,
        pair: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>>;

    async fn find_by_timestamp_and_source(
        &self,
        timestamp: DateTime<Utc>,
        pair: &str,
        source: &str,
    ) -> Result<Option<Bar>>;

    /// Returns false when no bar had this id
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Copy `calculated`, `calculated_at` and `calculated_version` from each
    /// bar onto the stored bar with the same id. All-or-nothing: if any id
    /// is unknown nothing is written and false is returned.
    async fn update_flags_batch(&self, bars: &[Bar]) -> Result<bool>;

    /// The `limit` most recent bars strictly before `before`, ascending
    async fn find_recent_before(
        &self,
        pair: &str,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>>;

    /// Oldest-first bars not calculated at `target_version`
    async fn find_pending(
        &self,
        pair: &str,
        timeframe: Timeframe,
        target_version: u32,
        limit: usize,
    ) -> Result<Vec<Bar>>;

    async fn count_bars(&self, pair: &str, timeframe: Timeframe) -> Result<usize>;

    /// Bars calculated at `min_version` or later
    async fn count_calculated(
        &self,
        pair: &str,
        timeframe: Timeframe,
        min_version: u32,
    ) -> Result<usize>;

    /// Calculated bars with timestamp strictly after `after`, ascending
    async fn find_calculated_after(
        &self,
        pair: &str,
        timeframe: Timeframe,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>>;

    async fn latest(&self, pair: &str, timeframe: Timeframe) -> Result<Option<Bar>>;

    async fn save_indicators(&self, record: &IndicatorRecord) -> Result<()>;

    async fn find_indicators(
        &self,
        pair: &str,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<IndicatorRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Market data changed: old row deleted, new row written uncalculated
    Replaced,
    /// Identical data already stored; calculation flags kept
    Unchanged,
}

/// Idempotent replace by unique key.
///
/// Re-writing identical OHLCV is a no-op so already computed indicators are
/// not invalidated. Changed data is deleted and reinserted with cleared
/// calculation flags so the backlog picks it up again.
pub async fn upsert_bar(store: &dyn BarStore, mut bar: Bar) -> Result<(Bar, UpsertOutcome)> {
    let existing = store
        .find_by_timestamp_and_source(bar.timestamp, &bar.pair, &bar.source)
        .await?;

    bar.clear_calculation();

    match existing {
        Some(existing) if existing.same_ohlcv(&bar) => Ok((existing, UpsertOutcome::Unchanged)),
        Some(existing) => {
            store.delete(&existing.id).await?;
            let saved = store.save(bar).await?;
            debug!(
                "Replaced {} {} @ {} (was O:{} H:{} L:{} C:{} V:{})",
                saved.pair,
                saved.source,
                saved.timestamp,
                existing.open,
                existing.high,
                existing.low,
                existing.close,
                existing.volume
            );
            Ok((saved, UpsertOutcome::Replaced))
        }
        None => {
            let saved = store.save(bar).await?;
            Ok((saved, UpsertOutcome::Inserted))
        }
    }
}

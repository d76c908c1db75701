/// Bar aggregation from raw 5m history
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::{AggregationSettings, AggregationWindow, GapPolicy};
use crate::data::store::{upsert_bar, BarStore, UpsertOutcome};
use crate::error::{PipelineError, Result};
use crate::time::{last_closed_windows, window_end, windows_between, Clock};
use crate::types::{Bar, Timeframe};

/// Running OHLCV fold over constituents of one window
#[derive(Debug, Clone)]
struct WindowFold {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: i64,
    count: usize,
    last_timestamp: DateTime<Utc>,
    max_gap: Duration,
}

impl WindowFold {
    fn new(first: &Bar) -> Self {
        WindowFold {
            open: first.open,
            high: first.high,
            low: first.low,
            close: first.close,
            volume: first.volume,
            count: 1,
            last_timestamp: first.timestamp,
            max_gap: Duration::zero(),
        }
    }

    fn update(&mut self, bar: &Bar) {
        let gap = bar.timestamp - self.last_timestamp;
        if gap > self.max_gap {
            self.max_gap = gap;
        }

        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
        self.count += 1;
        self.last_timestamp = bar.timestamp;
    }

    fn to_bar(&self, pair: &str, timeframe: Timeframe, window_start: DateTime<Utc>) -> Bar {
        Bar::new(
            pair,
            timeframe,
            window_start,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

/// Fold ascending constituents into one bar for the window.
///
/// Returns `InsufficientData` below `min_data_points`. The degraded flag is
/// set when two consecutive constituents are further apart than
/// `max_gap_minutes`; the caller decides what a degraded window means.
pub fn fold_window(
    pair: &str,
    timeframe: Timeframe,
    window_start: DateTime<Utc>,
    constituents: &[Bar],
    window: &AggregationWindow,
) -> Result<Bar> {
    if constituents.len() < window.min_data_points {
        return Err(PipelineError::InsufficientData(format!(
            "{} {} @ {}: {} of {} bars",
            pair,
            timeframe,
            window_start,
            constituents.len(),
            window.min_data_points
        )));
    }

    let (first, rest) = constituents.split_first().ok_or_else(|| {
        PipelineError::InsufficientData(format!("{} {} @ {}: empty", pair, timeframe, window_start))
    })?;

    let mut fold = WindowFold::new(first);
    for bar in rest {
        fold.update(bar);
    }

    let mut bar = fold.to_bar(pair, timeframe, window_start);
    bar.quality_degraded = fold.max_gap > Duration::minutes(window.max_gap_minutes);
    Ok(bar)
}

/// Builds 1h/4h/1d bars for one pair from the stored 5m bars
pub struct Aggregator {
    pair: String,
    store: Arc<dyn BarStore>,
    clock: Arc<dyn Clock>,
    settings: AggregationSettings,
    tz: Tz,
}

impl Aggregator {
    pub fn new(
        pair: String,
        store: Arc<dyn BarStore>,
        clock: Arc<dyn Clock>,
        settings: AggregationSettings,
        tz: Tz,
    ) -> Self {
        Aggregator {
            pair,
            store,
            clock,
            settings,
            tz,
        }
    }

    fn window_config(&self, timeframe: Timeframe) -> Result<AggregationWindow> {
        self.settings.window(timeframe).ok_or_else(|| {
            PipelineError::Validation(format!("{} is not a derived timeframe", timeframe))
        })
    }

    /// Recompute the most recently closed window(s) of `timeframe`.
    ///
    /// Windows without enough constituents are skipped. Returns the bars now
    /// stored for the windows that produced one, oldest first.
    pub async fn aggregate(&self, timeframe: Timeframe) -> Result<Vec<Bar>> {
        self.window_config(timeframe)?;

        let windows = last_closed_windows(
            timeframe,
            self.clock.now(),
            &self.tz,
            self.settings.recompute_windows.max(1),
        );

        self.aggregate_windows(timeframe, &windows).await
    }

    /// Like `aggregate`, but also rebuilds every closed window from the one
    /// containing `changed_since` onwards, e.g. after a gap fill rewrote
    /// older raw bars.
    pub async fn aggregate_since(
        &self,
        timeframe: Timeframe,
        changed_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>> {
        let Some(since) = changed_since else {
            return self.aggregate(timeframe).await;
        };
        self.window_config(timeframe)?;

        let now = self.clock.now();
        let mut windows: BTreeSet<DateTime<Utc>> = windows_between(timeframe, since, now, &self.tz)
            .into_iter()
            .filter(|w| window_end(timeframe, *w, &self.tz) <= now)
            .collect();
        windows.extend(last_closed_windows(
            timeframe,
            now,
            &self.tz,
            self.settings.recompute_windows.max(1),
        ));

        let windows: Vec<_> = windows.into_iter().collect();
        if windows.len() > 1 {
            debug!(
                "Re-aggregating {} {} windows for {} since {}",
                windows.len(),
                timeframe,
                self.pair,
                since
            );
        }
        self.aggregate_windows(timeframe, &windows).await
    }

    /// Rebuild every closed window intersecting `[start, end)`
    pub async fn backfill(
        &self,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        self.window_config(timeframe)?;

        let now = self.clock.now();
        let windows: Vec<_> = windows_between(timeframe, start, end, &self.tz)
            .into_iter()
            .filter(|w| window_end(timeframe, *w, &self.tz) <= now)
            .collect();

        info!(
            "Backfilling {} {} windows for {} from {} to {}",
            windows.len(),
            timeframe,
            self.pair,
            start,
            end
        );

        self.aggregate_windows(timeframe, &windows).await
    }

    async fn aggregate_windows(
        &self,
        timeframe: Timeframe,
        windows: &[DateTime<Utc>],
    ) -> Result<Vec<Bar>> {
        let mut produced = Vec::with_capacity(windows.len());

        for window_start in windows {
            match self.aggregate_window(timeframe, *window_start).await {
                Ok(bar) => produced.push(bar),
                Err(PipelineError::InsufficientData(msg)) => {
                    debug!("Skipping window: {}", msg);
                }
                Err(PipelineError::Validation(msg)) => {
                    warn!("Rejected window: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(produced)
    }

    /// Aggregate a single window and upsert the result.
    ///
    /// Fails with `InsufficientData` below the window's `min_data_points`
    /// and, under the strict gap policy, with `Validation` for a degraded
    /// window. Neither case writes anything.
    pub async fn aggregate_window(
        &self,
        timeframe: Timeframe,
        window_start: DateTime<Utc>,
    ) -> Result<Bar> {
        let window = self.window_config(timeframe)?;
        let window_end = window_end(timeframe, window_start, &self.tz);

        // A 25h DST day holds 300 raw bars
        let capacity = ((window_end - window_start).num_minutes() / 5).max(1) as usize;
        let constituents = self
            .store
            .find_by_range(
                &self.pair,
                Timeframe::FiveMinute,
                window_start,
                window_end,
                capacity,
            )
            .await?;

        let bar = fold_window(&self.pair, timeframe, window_start, &constituents, &window)?;

        if bar.quality_degraded {
            if self.settings.gap_policy == GapPolicy::Strict {
                return Err(PipelineError::Validation(format!(
                    "{} {} @ {}: gap above {}m",
                    self.pair, timeframe, window_start, window.max_gap_minutes
                )));
            }
            warn!(
                "Quality-degraded {} bar for {} @ {}: constituent gap above {}m",
                timeframe, self.pair, window_start, window.max_gap_minutes
            );
        }

        let (saved, outcome) = upsert_bar(self.store.as_ref(), bar).await?;

        match outcome {
            UpsertOutcome::Unchanged => {
                debug!("{} {} @ {} unchanged", self.pair, timeframe, window_start);
            }
            _ => {
                debug!(
                    "Aggregated {} {} @ {} ({:?}) - O:{} H:{} L:{} C:{} V:{} from {} bars",
                    self.pair,
                    timeframe,
                    window_start,
                    outcome,
                    saved.open,
                    saved.high,
                    saved.low,
                    saved.close,
                    saved.volume,
                    constituents.len()
                );
            }
        }

        Ok(saved)
    }
}

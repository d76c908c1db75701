/// Raw bar normalisation and persistence
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::store::{upsert_bar, BarStore, UpsertOutcome};
use crate::error::{PipelineError, Result};
use crate::types::{Bar, RawBar, Timeframe};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub received: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// High/low clamped to the open/close envelope
    pub corrected: usize,
    /// Malformed rows dropped
    pub discarded: usize,
    /// Oldest bar inserted or replaced; derived windows from here on are stale
    pub earliest_written: Option<DateTime<Utc>>,
}

impl IngestReport {
    pub fn written(&self) -> usize {
        self.inserted + self.replaced
    }

    pub fn absorb(&mut self, other: &IngestReport) {
        self.received += other.received;
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.corrected += other.corrected;
        self.discarded += other.discarded;
        self.earliest_written = match (self.earliest_written, other.earliest_written) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Turn a raw row into a 5m bar. Returns the bar and whether it was corrected.
pub fn normalize_raw_bar(pair: &str, raw: &RawBar) -> Result<(Bar, bool)> {
    let price = |value: Option<Decimal>, field: &str| -> Result<Decimal> {
        match value {
            Some(v) if v > Decimal::ZERO => Ok(v),
            Some(v) => Err(PipelineError::Validation(format!(
                "{} @ {}: non-positive {} {}",
                pair, raw.timestamp, field, v
            ))),
            None => Err(PipelineError::Validation(format!(
                "{} @ {}: missing {}",
                pair, raw.timestamp, field
            ))),
        }
    };

    let open = price(raw.open, "open")?;
    let high = price(raw.high, "high")?;
    let low = price(raw.low, "low")?;
    let close = price(raw.close, "close")?;

    let volume = raw.volume.unwrap_or(0);
    if volume < 0 {
        return Err(PipelineError::Validation(format!(
            "{} @ {}: negative volume {}",
            pair, raw.timestamp, volume
        )));
    }

    let mut bar = Bar::new(
        pair,
        Timeframe::FiveMinute,
        raw.timestamp,
        open,
        high,
        low,
        close,
        volume,
    );
    let corrected = bar.enforce_envelope();

    Ok((bar, corrected))
}

/// Persists fetched rows as `raw-5m` bars
pub struct RawBarIngestor {
    pair: String,
    store: Arc<dyn BarStore>,
}

impl RawBarIngestor {
    pub fn new(pair: String, store: Arc<dyn BarStore>) -> Self {
        RawBarIngestor { pair, store }
    }

    /// Validate, deduplicate and upsert rows in ascending timestamp order.
    ///
    /// Invalid rows are counted and skipped; store failures abort the batch.
    pub async fn ingest(&self, rows: &[RawBar]) -> Result<IngestReport> {
        let mut report = IngestReport {
            received: rows.len(),
            ..IngestReport::default()
        };

        // Later duplicates of a timestamp win, and the map keeps time order
        let mut by_timestamp: BTreeMap<_, Bar> = BTreeMap::new();
        for raw in rows {
            match normalize_raw_bar(&self.pair, raw) {
                Ok((bar, corrected)) => {
                    if corrected {
                        report.corrected += 1;
                        debug!("Clamped OHLC envelope for {} @ {}", self.pair, bar.timestamp);
                    }
                    by_timestamp.insert(bar.timestamp, bar);
                }
                Err(e) => {
                    warn!("Discarding raw bar: {} ({})", e, e.error_code());
                    report.discarded += 1;
                }
            }
        }

        for bar in by_timestamp.into_values() {
            let timestamp = bar.timestamp;
            let (_, outcome) = upsert_bar(self.store.as_ref(), bar).await?;
            match outcome {
                UpsertOutcome::Inserted => report.inserted += 1,
                UpsertOutcome::Replaced => report.replaced += 1,
                UpsertOutcome::Unchanged => {
                    report.unchanged += 1;
                    continue;
                }
            }
            report.earliest_written.get_or_insert(timestamp);
        }

        debug!(
            "Ingested {} rows for {}: {} new, {} replaced, {} unchanged, {} discarded",
            report.received,
            self.pair,
            report.inserted,
            report.replaced,
            report.unchanged,
            report.discarded
        );

        Ok(report)
    }
}

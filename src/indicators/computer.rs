/// Differential indicator computation over the backlog
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{IndicatorKind, IndicatorSettings, IndicatorSpec};
use crate::data::{BacklogTracker, BarStore};
use crate::error::Result;
use crate::indicators::calc::{
    calculate_adx, calculate_atr, calculate_ema, calculate_rsi, calculate_sma, Ohlc,
};
use crate::time::Clock;
use crate::types::{Bar, IndicatorRecord, Timeframe};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeReport {
    pub processed: usize,
    /// Left uncalculated for lack of history
    pub skipped: usize,
}

/// Evaluate every configured indicator on the last element of `series`.
///
/// Returns `None` if any indicator lacks history.
pub fn evaluate(specs: &[IndicatorSpec], series: &[Ohlc]) -> Option<BTreeMap<String, f64>> {
    let mut values = BTreeMap::new();

    for spec in specs {
        match spec.kind {
            IndicatorKind::Rsi => {
                values.insert(spec.name(), calculate_rsi(series, spec.period)?);
            }
            IndicatorKind::Ema => {
                values.insert(spec.name(), calculate_ema(series, spec.period)?);
            }
            IndicatorKind::Sma => {
                values.insert(spec.name(), calculate_sma(series, spec.period)?);
            }
            IndicatorKind::Atr => {
                values.insert(spec.name(), calculate_atr(series, spec.period)?);
            }
            IndicatorKind::Adx => {
                let adx = calculate_adx(series, spec.period)?;
                values.insert(spec.name(), adx.adx);
                values.insert(format!("plus_di_{}", spec.period), adx.plus_di);
                values.insert(format!("minus_di_{}", spec.period), adx.minus_di);
            }
        }
    }

    Some(values)
}

/// Drains the backlog: compute, persist values, then flag calculated
pub struct IndicatorComputer {
    pair: String,
    store: Arc<dyn BarStore>,
    backlog: Arc<BacklogTracker>,
    clock: Arc<dyn Clock>,
    settings: IndicatorSettings,
}

impl IndicatorComputer {
    pub fn new(
        pair: String,
        store: Arc<dyn BarStore>,
        backlog: Arc<BacklogTracker>,
        clock: Arc<dyn Clock>,
        settings: IndicatorSettings,
    ) -> Self {
        IndicatorComputer {
            pair,
            store,
            backlog,
            clock,
            settings,
        }
    }

    /// Compute indicators for up to `limit` pending bars of `timeframe`.
    ///
    /// Bars are only flagged after their values are stored, so a failure in
    /// between leaves them pending and they are recomputed next time.
    pub async fn compute(&self, timeframe: Timeframe, limit: usize) -> Result<ComputeReport> {
        let version = self.backlog.target_version();
        let lookback = self.settings.max_lookback();
        let limit = limit.max(1);

        // At most `lookback` bars (the head of the series) lack history, so
        // reading that many extra guarantees progress past them.
        let pending = self
            .backlog
            .get_uncalculated(timeframe, limit.saturating_add(lookback))
            .await?;

        let mut report = ComputeReport::default();
        let mut computed: Vec<Bar> = Vec::with_capacity(limit.min(pending.len()));

        for bar in pending {
            if computed.len() == limit {
                break;
            }

            let history = self
                .store
                .find_recent_before(&self.pair, timeframe, bar.timestamp, lookback)
                .await?;

            if history.len() < lookback {
                debug!(
                    "Skipping {} {} @ {}: {} of {} history bars",
                    self.pair,
                    timeframe,
                    bar.timestamp,
                    history.len(),
                    lookback
                );
                report.skipped += 1;
                continue;
            }

            let series: Vec<Ohlc> = history.iter().chain(Some(&bar)).map(Ohlc::from).collect();
            let Some(values) = evaluate(&self.settings.specs, &series) else {
                report.skipped += 1;
                continue;
            };

            let record = IndicatorRecord {
                pair: bar.pair.clone(),
                source: bar.source.clone(),
                timestamp: bar.timestamp,
                version,
                values,
                computed_at: self.clock.now(),
            };
            self.store.save_indicators(&record).await?;
            computed.push(bar);
        }

        if !computed.is_empty() {
            if self.backlog.mark_calculated(&computed, version).await? {
                report.processed = computed.len();
            } else {
                warn!(
                    "{} {} bars changed during computation; left pending",
                    computed.len(),
                    timeframe
                );
                report.skipped += computed.len();
            }
        }

        debug!(
            "Computed {} {} at v{}: {} processed, {} skipped",
            self.pair, timeframe, version, report.processed, report.skipped
        );

        Ok(report)
    }
}

/// In-memory bar store: ordered index keyed by (pair, source, timestamp)
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::data::store::BarStore;
use crate::error::Result;
use crate::types::{Bar, IndicatorRecord, Timeframe};

type BarKey = (String, String, DateTime<Utc>);

fn key(pair: &str, source: &str, timestamp: DateTime<Utc>) -> BarKey {
    (pair.to_string(), source.to_string(), timestamp)
}

/// Synchronous index shared by the in-memory and JSONL-backed stores
#[derive(Debug, Default)]
pub(crate) struct BarIndex {
    bars: BTreeMap<BarKey, Bar>,
    ids: HashMap<String, BarKey>,
    indicators: HashMap<BarKey, IndicatorRecord>,
}

impl BarIndex {
    pub(crate) fn upsert(&mut self, bar: Bar) -> Bar {
        let k = key(&bar.pair, &bar.source, bar.timestamp);
        if let Some(previous) = self.bars.get(&k) {
            self.ids.remove(&previous.id);
        }
        self.ids.insert(bar.id.clone(), k.clone());
        self.bars.insert(k, bar.clone());
        bar
    }

    pub(crate) fn get(&self, timestamp: DateTime<Utc>, pair: &str, source: &str) -> Option<&Bar> {
        self.bars.get(&key(pair, source, timestamp))
    }

    pub(crate) fn bar_by_id(&self, id: &str) -> Option<Bar> {
        self.ids.get(id).and_then(|k| self.bars.get(k)).cloned()
    }

    pub(crate) fn delete(&mut self, id: &str) -> bool {
        match self.ids.remove(id) {
            Some(k) => {
                self.bars.remove(&k);
                self.indicators.remove(&k);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains_all(&self, bars: &[Bar]) -> bool {
        bars.iter().all(|b| self.ids.contains_key(&b.id))
    }

    /// Caller must check `contains_all` first
    pub(crate) fn apply_flags(&mut self, bars: &[Bar]) {
        for update in bars {
            if let Some(k) = self.ids.get(&update.id) {
                if let Some(stored) = self.bars.get_mut(k) {
                    stored.calculated = update.calculated;
                    stored.calculated_at = update.calculated_at;
                    stored.calculated_version = update.calculated_version;
                }
            }
        }
    }

    fn series(
        &self,
        pair: &str,
        source: &str,
        lower: Bound<DateTime<Utc>>,
        upper: Bound<DateTime<Utc>>,
    ) -> impl DoubleEndedIterator<Item = &Bar> {
        let wrap = |bound: Bound<DateTime<Utc>>, edge: DateTime<Utc>| match bound {
            Bound::Included(t) => Bound::Included(key(pair, source, t)),
            Bound::Excluded(t) => Bound::Excluded(key(pair, source, t)),
            Bound::Unbounded => Bound::Included(key(pair, source, edge)),
        };
        let range = (
            wrap(lower, DateTime::<Utc>::MIN_UTC),
            wrap(upper, DateTime::<Utc>::MAX_UTC),
        );
        self.bars.range(range).map(|(_, bar)| bar)
    }

    pub(crate) fn range(
        &self,
        pair: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Bar> {
        if start >= end {
            return Vec::new();
        }
        self.series(pair, timeframe.source(), Bound::Included(start), Bound::Excluded(end))
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn recent_before(
        &self,
        pair: &str,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Bar> {
        let mut bars: Vec<Bar> = self
            .series(pair, timeframe.source(), Bound::Unbounded, Bound::Excluded(before))
            .rev()
            .take(limit)
            .cloned()
            .collect();
        bars.reverse();
        bars
    }

    pub(crate) fn pending(
        &self,
        pair: &str,
        timeframe: Timeframe,
        target_version: u32,
        limit: usize,
    ) -> Vec<Bar> {
        self.series(pair, timeframe.source(), Bound::Unbounded, Bound::Unbounded)
            .filter(|b| !b.is_current(target_version))
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn count(&self, pair: &str, timeframe: Timeframe) -> usize {
        self.series(pair, timeframe.source(), Bound::Unbounded, Bound::Unbounded)
            .count()
    }

    pub(crate) fn count_calculated(&self, pair: &str, timeframe: Timeframe, min_version: u32) -> usize {
        self.series(pair, timeframe.source(), Bound::Unbounded, Bound::Unbounded)
            .filter(|b| b.is_current(min_version))
            .count()
    }

    pub(crate) fn calculated_after(
        &self,
        pair: &str,
        timeframe: Timeframe,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Bar> {
        self.series(pair, timeframe.source(), Bound::Excluded(after), Bound::Unbounded)
            .filter(|b| b.calculated)
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn latest(&self, pair: &str, timeframe: Timeframe) -> Option<Bar> {
        self.series(pair, timeframe.source(), Bound::Unbounded, Bound::Unbounded)
            .next_back()
            .cloned()
    }

    pub(crate) fn put_indicators(&mut self, record: IndicatorRecord) {
        let k = key(&record.pair, &record.source, record.timestamp);
        self.indicators.insert(k, record);
    }

    pub(crate) fn indicators(
        &self,
        pair: &str,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
    ) -> Option<IndicatorRecord> {
        self.indicators
            .get(&key(pair, timeframe.source(), timestamp))
            .cloned()
    }

    pub(crate) fn all_bars(&self) -> impl Iterator<Item = &Bar> {
        self.bars.values()
    }

    pub(crate) fn all_indicators(&self) -> impl Iterator<Item = &IndicatorRecord> {
        self.indicators.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.bars.len()
    }

    pub(crate) fn indicator_count(&self) -> usize {
        self.indicators.len()
    }
}

/// Thread-safe in-memory bar store
#[derive(Debug, Default)]
pub struct InMemoryBarStore {
    index: RwLock<BarIndex>,
}

impl InMemoryBarStore {
    pub fn new() -> Self {
        InMemoryBarStore::default()
    }

    /// Total bars across all pairs and sources
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn save(&self, bar: Bar) -> Result<Bar> {
        Ok(self.index.write().await.upsert(bar))
    }

    async fn find_by_range(
        &self,
        pair: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self.index.read().await.range(pair, timeframe, start, end, limit))
    }

    async fn find_by_timestamp_and_source(
        &self,
        timestamp: DateTime<Utc>,
        pair: &str,
        source: &str,
    ) -> Result<Option<Bar>> {
        Ok(self.index.read().await.get(timestamp, pair, source).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.index.write().await.delete(id))
    }

    async fn update_flags_batch(&self, bars: &[Bar]) -> Result<bool> {
        let mut index = self.index.write().await;
        if !index.contains_all(bars) {
            return Ok(false);
        }
        index.apply_flags(bars);
        Ok(true)
    }

    async fn find_recent_before(
        &self,
        pair: &str,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self.index.read().await.recent_before(pair, timeframe, before, limit))
    }

    async fn find_pending(
        &self,
        pair: &str,
        timeframe: Timeframe,
        target_version: u32,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self.index.read().await.pending(pair, timeframe, target_version, limit))
    }

    async fn count_bars(&self, pair: &str, timeframe: Timeframe) -> Result<usize> {
        Ok(self.index.read().await.count(pair, timeframe))
    }

    async fn count_calculated(
        &self,
        pair: &str,
        timeframe: Timeframe,
        min_version: u32,
    ) -> Result<usize> {
        Ok(self.index.read().await.count_calculated(pair, timeframe, min_version))
    }

    async fn find_calculated_after(
        &self,
        pair: &str,
        timeframe: Timeframe,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self.index.read().await.calculated_after(pair, timeframe, after, limit))
    }

    async fn latest(&self, pair: &str, timeframe: Timeframe) -> Result<Option<Bar>> {
        Ok(self.index.read().await.latest(pair, timeframe))
    }

    async fn save_indicators(&self, record: &IndicatorRecord) -> Result<()> {
        self.index.write().await.put_indicators(record.clone());
        Ok(())
    }

    async fn find_indicators(
        &self,
        pair: &str,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<IndicatorRecord>> {
        Ok(self.index.read().await.indicators(pair, timeframe, timestamp))
    }
}

/// JSONL-backed bar store
///
/// The full index lives in memory; every mutation is appended to an
/// operation log and fsynced before it is applied, so a crash never leaves
/// the index ahead of the disk. The log is replayed on open.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::data::memory_store::BarIndex;
use crate::data::store::BarStore;
use crate::error::Result;
use crate::types::{Bar, IndicatorRecord, Timeframe};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum StoreOp {
    Upsert { bar: Bar },
    Delete { id: String },
    Flags { bars: Vec<FlagUpdate> },
    Indicators { record: IndicatorRecord },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlagUpdate {
    id: String,
    calculated: bool,
    calculated_at: Option<DateTime<Utc>>,
    calculated_version: u32,
}

impl FlagUpdate {
    fn from_bar(bar: &Bar) -> Self {
        FlagUpdate {
            id: bar.id.clone(),
            calculated: bar.calculated,
            calculated_at: bar.calculated_at,
            calculated_version: bar.calculated_version,
        }
    }
}

fn apply(index: &mut BarIndex, op: StoreOp) {
    match op {
        StoreOp::Upsert { bar } => {
            index.upsert(bar);
        }
        StoreOp::Delete { id } => {
            index.delete(&id);
        }
        StoreOp::Flags { bars } => {
            let updates: Vec<Bar> = bars
                .into_iter()
                .filter_map(|u| {
                    index.bar_by_id(&u.id).map(|mut bar| {
                        bar.calculated = u.calculated;
                        bar.calculated_at = u.calculated_at;
                        bar.calculated_version = u.calculated_version;
                        bar
                    })
                })
                .collect();
            index.apply_flags(&updates);
        }
        StoreOp::Indicators { record } => index.put_indicators(record),
    }
}

/// Auto-compact once the log holds this many ops per live record
const COMPACT_FACTOR: usize = 4;
const DEFAULT_COMPACT_MIN_OPS: usize = 10_000;

struct LogState {
    index: BarIndex,
    log_file: PathBuf,
    ops_written: usize,
    compact_min_ops: usize,
}

impl LogState {
    async fn append(&mut self, ops: &[StoreOp]) -> Result<()> {
        let mut buffer = String::new();
        for op in ops {
            buffer.push_str(&serde_json::to_string(op)?);
            buffer.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.sync_all().await?;

        self.ops_written += ops.len();
        Ok(())
    }

    async fn commit(&mut self, op: StoreOp) -> Result<()> {
        self.append(std::slice::from_ref(&op)).await?;
        apply(&mut self.index, op);

        // The op is durable at this point; a failed rewrite keeps the old log
        let live = self.index.len() + self.index.indicator_count();
        if self.ops_written >= self.compact_min_ops
            && self.ops_written > live.max(1) * COMPACT_FACTOR
        {
            if let Err(e) = self.rewrite().await {
                warn!("Automatic compaction of {} failed: {}", self.log_file.display(), e);
            }
        }
        Ok(())
    }

    /// Replace the log with one op per live bar and indicator record
    async fn rewrite(&mut self) -> Result<()> {
        let mut ops: Vec<StoreOp> = self
            .index
            .all_bars()
            .cloned()
            .map(|bar| StoreOp::Upsert { bar })
            .collect();
        ops.extend(
            self.index
                .all_indicators()
                .cloned()
                .map(|record| StoreOp::Indicators { record }),
        );

        let tmp = self.log_file.with_extension("jsonl.compact");
        let mut buffer = String::new();
        for op in &ops {
            buffer.push_str(&serde_json::to_string(op)?);
            buffer.push('\n');
        }

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(buffer.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &self.log_file).await?;

        debug!(
            "Compacted {} from {} to {} ops",
            self.log_file.display(),
            self.ops_written,
            ops.len()
        );
        self.ops_written = ops.len();
        Ok(())
    }
}

pub struct JsonlBarStore {
    state: RwLock<LogState>,
}

impl JsonlBarStore {
    /// Open the log at `path`, replaying any existing operations
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let log_file = path.as_ref().to_path_buf();
        if let Some(parent) = log_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut index = BarIndex::default();
        let mut replayed = 0usize;
        let mut skipped = 0usize;

        if log_file.exists() {
            let file = tokio::fs::File::open(&log_file).await?;
            let mut lines = BufReader::new(file).lines();

            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoreOp>(&line) {
                    Ok(op) => {
                        apply(&mut index, op);
                        replayed += 1;
                    }
                    Err(e) => {
                        // Torn final write after a crash
                        warn!("Skipping unreadable store log line: {}", e);
                        skipped += 1;
                    }
                }
            }
        }

        info!(
            "Opened bar store {} - {} ops replayed, {} skipped, {} bars",
            log_file.display(),
            replayed,
            skipped,
            index.len()
        );

        let store = JsonlBarStore {
            state: RwLock::new(LogState {
                index,
                log_file,
                ops_written: replayed,
                compact_min_ops: DEFAULT_COMPACT_MIN_OPS,
            }),
        };

        // A torn tail would swallow the next appended line
        if skipped > 0 {
            store.compact().await?;
        }

        Ok(store)
    }

    /// Number of operations in the log since it was last compacted
    pub async fn log_len(&self) -> usize {
        self.state.read().await.ops_written
    }

    /// Compact automatically once the log reaches `ops` entries and is
    /// mostly superseded records
    pub fn with_compact_min_ops(mut self, ops: usize) -> Self {
        self.state.get_mut().compact_min_ops = ops.max(1);
        self
    }

    /// Rewrite the log as one upsert per live bar plus current indicators
    pub async fn compact(&self) -> Result<()> {
        self.state.write().await.rewrite().await
    }
}

#[async_trait]
impl BarStore for JsonlBarStore {
    async fn save(&self, bar: Bar) -> Result<Bar> {
        let mut state = self.state.write().await;
        state.commit(StoreOp::Upsert { bar: bar.clone() }).await?;
        Ok(bar)
    }

    async fn find_by_range(
        &self,
        pair: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self.state.read().await.index.range(pair, timeframe, start, end, limit))
    }

    async fn find_by_timestamp_and_source(
        &self,
        timestamp: DateTime<Utc>,
        pair: &str,
        source: &str,
    ) -> Result<Option<Bar>> {
        Ok(self.state.read().await.index.get(timestamp, pair, source).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.index.bar_by_id(id).is_none() {
            return Ok(false);
        }
        state.commit(StoreOp::Delete { id: id.to_string() }).await?;
        Ok(true)
    }

    async fn update_flags_batch(&self, bars: &[Bar]) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.index.contains_all(bars) {
            return Ok(false);
        }
        if bars.is_empty() {
            return Ok(true);
        }
        let updates = bars.iter().map(FlagUpdate::from_bar).collect();
        state.commit(StoreOp::Flags { bars: updates }).await?;
        Ok(true)
    }

    async fn find_recent_before(
        &self,
        pair: &str,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self
            .state
            .read()
            .await
            .index
            .recent_before(pair, timeframe, before, limit))
    }

    async fn find_pending(
        &self,
        pair: &str,
        timeframe: Timeframe,
        target_version: u32,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self
            .state
            .read()
            .await
            .index
            .pending(pair, timeframe, target_version, limit))
    }

    async fn count_bars(&self, pair: &str, timeframe: Timeframe) -> Result<usize> {
        Ok(self.state.read().await.index.count(pair, timeframe))
    }

    async fn count_calculated(
        &self,
        pair: &str,
        timeframe: Timeframe,
        min_version: u32,
    ) -> Result<usize> {
        Ok(self
            .state
            .read()
            .await
            .index
            .count_calculated(pair, timeframe, min_version))
    }

    async fn find_calculated_after(
        &self,
        pair: &str,
        timeframe: Timeframe,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        Ok(self
            .state
            .read()
            .await
            .index
            .calculated_after(pair, timeframe, after, limit))
    }

    async fn latest(&self, pair: &str, timeframe: Timeframe) -> Result<Option<Bar>> {
        Ok(self.state.read().await.index.latest(pair, timeframe))
    }

    async fn save_indicators(&self, record: &IndicatorRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .commit(StoreOp::Indicators {
                record: record.clone(),
            })
            .await
    }

    async fn find_indicators(
        &self,
        pair: &str,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<IndicatorRecord>> {
        Ok(self.state.read().await.index.indicators(pair, timeframe, timestamp))
    }
}

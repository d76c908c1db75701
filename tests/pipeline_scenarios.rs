//! End-to-end pipeline scenarios against an in-memory store and scripted fetcher
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Notify;

use candleflow::config::{
    AggregationSettings, IndicatorKind, IndicatorSettings, IndicatorSpec, PipelineConfig,
};
use candleflow::data::{Aggregator, BacklogTracker, BarStore, Fetcher, InMemoryBarStore};
use candleflow::indicators::IndicatorComputer;
use candleflow::scheduler::{HealthStatus, Scheduler, SchedulerStatus};
use candleflow::time::ManualClock;
use candleflow::{Bar, IndicatorRecord, PipelineError, RawBar, Result, Timeframe};

const PAIR: &str = "EURUSD";

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, hour, minute, 0).unwrap()
}

fn raw(timestamp: DateTime<Utc>, close: Decimal) -> RawBar {
    RawBar {
        timestamp,
        open: Some(dec!(1.0850)),
        high: Some(dec!(1.0880)),
        low: Some(dec!(1.0830)),
        close: Some(close),
        volume: Some(50),
    }
}

/// In-memory store that records write order, can be told to fail writes
/// and can hold the next indicator write until released
struct TestStore {
    inner: InMemoryBarStore,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<(String, DateTime<Utc>)>>,
    hold_indicators: AtomicBool,
    held: Notify,
    release: Notify,
}

impl TestStore {
    fn new() -> Self {
        TestStore {
            inner: InMemoryBarStore::new(),
            fail_writes: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            hold_indicators: AtomicBool::new(false),
            held: Notify::new(),
            release: Notify::new(),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn hold_next_indicator_write(&self) {
        self.hold_indicators.store(true, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PipelineError::Store("injected write failure".to_string()));
        }
        Ok(())
    }

    fn writes(&self) -> Vec<(String, DateTime<Utc>)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl BarStore for TestStore {
    async fn save(&self, bar: Bar) -> Result<Bar> {
        self.check_writable()?;
        self.writes
            .lock()
            .unwrap()
            .push((bar.source.clone(), bar.timestamp));
        self.inner.save(bar).await
    }

    async fn find_by_range(
        &self,
        pair: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.inner.find_by_range(pair, timeframe, start, end, limit).await
    }

    async fn find_by_timestamp_and_source(
        &self,
        timestamp: DateTime<Utc>,
        pair: &str,
        source: &str,
    ) -> Result<Option<Bar>> {
        self.inner
            .find_by_timestamp_and_source(timestamp, pair, source)
            .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        self.inner.delete(id).await
    }

    async fn update_flags_batch(&self, bars: &[Bar]) -> Result<bool> {
        self.check_writable()?;
        self.inner.update_flags_batch(bars).await
    }

    async fn find_recent_before(
        &self,
        pair: &str,
        timeframe: Timeframe,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.inner
            .find_recent_before(pair, timeframe, before, limit)
            .await
    }

    async fn find_pending(
        &self,
        pair: &str,
        timeframe: Timeframe,
        target_version: u32,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.inner
            .find_pending(pair, timeframe, target_version, limit)
            .await
    }

    async fn count_bars(&self, pair: &str, timeframe: Timeframe) -> Result<usize> {
        self.inner.count_bars(pair, timeframe).await
    }

    async fn count_calculated(
        &self,
        pair: &str,
        timeframe: Timeframe,
        min_version: u32,
    ) -> Result<usize> {
        self.inner.count_calculated(pair, timeframe, min_version).await
    }

    async fn find_calculated_after(
        &self,
        pair: &str,
        timeframe: Timeframe,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.inner
            .find_calculated_after(pair, timeframe, after, limit)
            .await
    }

    async fn latest(&self, pair: &str, timeframe: Timeframe) -> Result<Option<Bar>> {
        self.inner.latest(pair, timeframe).await
    }

    async fn save_indicators(&self, record: &IndicatorRecord) -> Result<()> {
        self.check_writable()?;
        if self.hold_indicators.swap(false, Ordering::SeqCst) {
            self.held.notify_one();
            self.release.notified().await;
        }
        self.inner.save_indicators(record).await
    }

    async fn find_indicators(
        &self,
        pair: &str,
        timeframe: Timeframe,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<IndicatorRecord>> {
        self.inner.find_indicators(pair, timeframe, timestamp).await
    }
}

/// Serves a scripted latest bar and history until re-scripted; can be
/// switched to failing with network errors
struct ScriptedFetcher {
    feed: Mutex<(Option<RawBar>, Vec<RawBar>)>,
    offline: AtomicBool,
}

impl ScriptedFetcher {
    fn new(latest: Option<RawBar>, history: Vec<RawBar>) -> Arc<Self> {
        Arc::new(ScriptedFetcher {
            feed: Mutex::new((latest, history)),
            offline: AtomicBool::new(false),
        })
    }

    fn script(&self, latest: Option<RawBar>, history: Vec<RawBar>) {
        *self.feed.lock().unwrap() = (latest, history);
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PipelineError::Network("feed unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn get_historical(&self, _: &str, _: &str, _: &str) -> Result<Vec<RawBar>> {
        self.check_online()?;
        Ok(self.feed.lock().unwrap().1.clone())
    }

    async fn get_latest(&self, _: &str) -> Result<Option<RawBar>> {
        self.check_online()?;
        Ok(self.feed.lock().unwrap().0.clone())
    }
}

/// Raw rows every 5 minutes over `[from, to)`
fn raw_series(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<RawBar> {
    let mut rows = Vec::new();
    let mut ts = from;
    while ts < to {
        rows.push(raw(ts, dec!(1.0860)));
        ts += chrono::Duration::minutes(5);
    }
    rows
}

fn scheduler_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.scheduler.bootstrap_period = None;
    config.scheduler.interval_minutes = 5;
    config.scheduler.retry_delay_seconds = 30;
    config.scheduler.max_consecutive_failures = 5;
    config
}

fn build_scheduler(
    config: &PipelineConfig,
    store: Arc<TestStore>,
    fetcher: Arc<ScriptedFetcher>,
    clock: ManualClock,
) -> Arc<Scheduler> {
    let scheduler = Scheduler::new(config, store, fetcher, Arc::new(clock)).unwrap();
    Arc::new(scheduler)
}

#[tokio::test]
async fn scenario_a_twelve_bars_make_one_hour_bar() {
    let store = Arc::new(InMemoryBarStore::new());

    for i in 0..12i64 {
        let open = Decimal::new(10_850 + i, 4);
        let high = if i == 4 { dec!(1.0950) } else { open + dec!(0.0010) };
        let low = if i == 9 { dec!(1.0700) } else { open - dec!(0.0010) };
        let bar = Bar::new(
            PAIR,
            Timeframe::FiveMinute,
            at(10, 0) + chrono::Duration::minutes(5 * i),
            open,
            high,
            low,
            open + dec!(0.0005),
            100 + i,
        );
        store.save(bar).await.unwrap();
    }

    let clock = Arc::new(ManualClock::new(at(11, 0) + chrono::Duration::seconds(30)));
    let aggregator = Aggregator::new(
        PAIR.to_string(),
        store.clone(),
        clock,
        AggregationSettings::default(),
        chrono_tz::UTC,
    );

    let bars = aggregator.aggregate(Timeframe::OneHour).await.unwrap();
    assert_eq!(bars.len(), 1);

    let hourly = &bars[0];
    assert_eq!(hourly.timestamp, at(10, 0));
    assert_eq!(hourly.source, "agg-1h");
    assert_eq!(hourly.open, dec!(1.0850));
    assert_eq!(hourly.high, dec!(1.0950));
    assert_eq!(hourly.low, dec!(1.0700));
    assert_eq!(hourly.close, dec!(1.0866));
    assert_eq!(hourly.volume, 1266);
    assert!(!hourly.quality_degraded);
    assert!(hourly.satisfies_envelope());

    let stored = store
        .find_by_timestamp_and_source(at(10, 0), PAIR, "agg-1h")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&stored, hourly);
}

#[tokio::test]
async fn scenario_b_sparse_window_writes_nothing() {
    let store = Arc::new(InMemoryBarStore::new());
    for i in 0..5i64 {
        let bar = Bar::new(
            PAIR,
            Timeframe::FiveMinute,
            at(10, 0) + chrono::Duration::minutes(5 * i),
            dec!(1.0850),
            dec!(1.0860),
            dec!(1.0840),
            dec!(1.0855),
            100,
        );
        store.save(bar).await.unwrap();
    }

    let mut settings = AggregationSettings::default();
    settings.one_hour.min_data_points = 12;
    let aggregator = Aggregator::new(
        PAIR.to_string(),
        store.clone(),
        Arc::new(ManualClock::new(at(11, 1))),
        settings,
        chrono_tz::UTC,
    );

    let bars = aggregator.aggregate(Timeframe::OneHour).await.unwrap();
    assert!(bars.is_empty());
    assert_eq!(store.count_bars(PAIR, Timeframe::OneHour).await.unwrap(), 0);
}

fn hour_bar(hour: u32) -> Bar {
    let close = if hour % 2 == 0 {
        Decimal::new(10_800 + hour as i64 * 4, 4)
    } else {
        Decimal::new(10_800 + hour as i64 * 2, 4)
    };
    Bar::new(
        PAIR,
        Timeframe::OneHour,
        at(hour, 0),
        close,
        close + dec!(0.0010),
        close - dec!(0.0010),
        close,
        1_000,
    )
}

#[tokio::test]
async fn scenario_c_rsi_waits_for_history() {
    let store = Arc::new(InMemoryBarStore::new());
    let clock = Arc::new(ManualClock::new(at(23, 0)));
    let settings = IndicatorSettings {
        specs: vec![IndicatorSpec::new(IndicatorKind::Rsi, 14)],
        ..IndicatorSettings::default()
    };
    let backlog = Arc::new(BacklogTracker::new(
        PAIR.to_string(),
        store.clone(),
        clock.clone(),
        settings.version,
        settings.batch_size,
    ));
    let computer = IndicatorComputer::new(
        PAIR.to_string(),
        store.clone(),
        backlog.clone(),
        clock,
        settings,
    );

    // 14:00 with ten bars of history before it
    for hour in 4..=14 {
        store.save(hour_bar(hour)).await.unwrap();
    }

    let report = computer.compute(Timeframe::OneHour, 100).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.skipped, 11);

    let target = store
        .find_by_timestamp_and_source(at(14, 0), PAIR, "agg-1h")
        .await
        .unwrap()
        .unwrap();
    assert!(!target.calculated);

    // Four older bars arrive late
    for hour in 0..4 {
        store.save(hour_bar(hour)).await.unwrap();
    }

    let report = computer.compute(Timeframe::OneHour, 100).await.unwrap();
    assert_eq!(report.processed, 1);

    let target = store
        .find_by_timestamp_and_source(at(14, 0), PAIR, "agg-1h")
        .await
        .unwrap()
        .unwrap();
    assert!(target.is_current(1));
    assert!(target.calculated_at.is_some());

    let record = store
        .find_indicators(PAIR, Timeframe::OneHour, at(14, 0))
        .await
        .unwrap()
        .unwrap();
    assert!(record.values.contains_key("rsi_14"));

    let status = backlog.get_status().await.unwrap();
    assert_eq!(status.timeframes[&Timeframe::OneHour].calculated, 1);
    assert_eq!(status.timeframes[&Timeframe::OneHour].uncalculated, 14);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_store_error_then_recovery() {
    let store = Arc::new(TestStore::new());
    store.set_failing(true);

    let fetcher = ScriptedFetcher::new(Some(raw(at(10, 0), dec!(1.0855))), Vec::new());
    let scheduler = build_scheduler(
        &scheduler_config(),
        store.clone(),
        fetcher,
        ManualClock::new(at(10, 7)),
    );

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.start().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let retry = scheduler.retry_state().await;
    assert_eq!(retry.consecutive_failures, 1);
    assert!(retry.running);
    assert!(retry.last_error.unwrap().contains("STORE_001"));
    assert_eq!(
        scheduler.health_check().await.status,
        HealthStatus::Degraded
    );

    store.set_failing(false);

    // Retry is scheduled retry_delay_seconds after the failure, not before
    tokio::time::sleep(Duration::from_secs(28)).await;
    assert_eq!(scheduler.get_stats().await.total_cycles, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = scheduler.get_stats().await;
    assert_eq!(stats.total_cycles, 2);
    assert_eq!(stats.successful_cycles, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert!(stats.last_success_at.is_some());
    assert_eq!(scheduler.health_check().await.status, HealthStatus::Healthy);

    scheduler.stop().await;
    runner.await.unwrap().unwrap();
    assert_eq!(scheduler.status().await, SchedulerStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_failure_ceiling_goes_critical() {
    let store = Arc::new(TestStore::new());
    store.set_failing(true);

    let fetcher = ScriptedFetcher::new(Some(raw(at(10, 0), dec!(1.0855))), Vec::new());
    let scheduler = build_scheduler(
        &scheduler_config(),
        store,
        fetcher,
        ManualClock::new(at(10, 7)),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(3600), scheduler.start()).await;
    assert!(matches!(outcome, Ok(Ok(()))));

    assert_eq!(scheduler.status().await, SchedulerStatus::Critical);
    let retry = scheduler.retry_state().await;
    assert!(!retry.running);
    assert_eq!(retry.consecutive_failures, 5);

    let stats = scheduler.get_stats().await;
    assert_eq!(stats.failed_cycles, 5);
    assert_eq!(stats.success_rate, 0.0);

    let health = scheduler.health_check().await;
    assert_eq!(health.status, HealthStatus::Critical);
    assert!(health.reasons[0].contains("5 consecutive failures"));
}

#[tokio::test]
async fn cycle_writes_each_source_in_time_order() {
    let store = Arc::new(TestStore::new());

    // History arrives newest first with one re-delivered row
    let mut history: Vec<RawBar> = (0..12i64)
        .rev()
        .map(|i| raw(at(10, 0) + chrono::Duration::minutes(5 * i), dec!(1.0860)))
        .collect();
    history.push(raw(at(10, 20), dec!(1.0870)));

    let fetcher = ScriptedFetcher::new(Some(raw(at(11, 0), dec!(1.0865))), history);
    let mut config = scheduler_config();
    config.aggregation.recompute_windows = 3;
    let scheduler = build_scheduler(
        &config,
        store.clone(),
        fetcher,
        ManualClock::new(at(11, 0) + chrono::Duration::seconds(30)),
    );

    let report = scheduler.run_cycle().await.unwrap();
    assert!(report.gap_filled);
    assert_eq!(report.ingest.received, 14);
    assert_eq!(report.ingest.inserted, 13);
    assert_eq!(report.aggregated[&Timeframe::OneHour], 1);
    assert!(report.is_clean());

    let mut by_source: BTreeMap<String, Vec<DateTime<Utc>>> = BTreeMap::new();
    for (source, timestamp) in store.writes() {
        by_source.entry(source).or_default().push(timestamp);
    }
    assert_eq!(by_source["raw-5m"].len(), 13);
    for timestamps in by_source.values() {
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    let redelivered = store
        .find_by_timestamp_and_source(at(10, 20), PAIR, "raw-5m")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.close, dec!(1.0870));

    for timeframe in Timeframe::all() {
        let bars = store
            .find_by_range(PAIR, timeframe, at(0, 0), at(23, 0), 1_000)
            .await
            .unwrap();
        assert!(bars.iter().all(Bar::satisfies_envelope));
    }

    let status = scheduler.backlog().get_status().await.unwrap();
    for snapshot in status.timeframes.values() {
        assert_eq!(snapshot.uncalculated, snapshot.total - snapshot.calculated);
    }
    assert_eq!(status.overall.total, 14);
}

#[tokio::test]
async fn repeated_cycle_is_idempotent() {
    let store = Arc::new(TestStore::new());
    let history: Vec<RawBar> = (0..12i64)
        .map(|i| raw(at(10, 0) + chrono::Duration::minutes(5 * i), dec!(1.0860)))
        .collect();
    let fetcher = ScriptedFetcher::new(Some(raw(at(11, 0), dec!(1.0865))), history);
    let scheduler = build_scheduler(
        &scheduler_config(),
        store.clone(),
        fetcher,
        ManualClock::new(at(11, 0) + chrono::Duration::seconds(30)),
    );

    scheduler.run_cycle().await.unwrap();
    let writes_after_first = store.writes().len();

    let second = scheduler.run_cycle().await.unwrap();
    assert!(!second.gap_filled);
    assert_eq!(second.ingest.inserted, 0);
    assert_eq!(second.ingest.unchanged, 1);
    assert_eq!(second.aggregated[&Timeframe::OneHour], 1);

    assert_eq!(store.writes().len(), writes_after_first);
    assert_eq!(store.count_bars(PAIR, Timeframe::OneHour).await.unwrap(), 1);
    assert_eq!(store.count_bars(PAIR, Timeframe::FiveMinute).await.unwrap(), 13);
}

#[tokio::test]
async fn outage_recovery_rebuilds_missed_windows() {
    let store = Arc::new(TestStore::new());
    let fetcher = ScriptedFetcher::new(
        Some(raw(at(11, 0), dec!(1.0860))),
        raw_series(at(10, 0), at(11, 0)),
    );
    let clock = ManualClock::new(at(11, 0) + chrono::Duration::seconds(30));
    let mut config = scheduler_config();
    config.scheduler.max_retries = 1;
    config.scheduler.max_consecutive_failures = 50;
    let scheduler = build_scheduler(&config, store.clone(), fetcher.clone(), clock.clone());

    let first = scheduler.run_cycle().await.unwrap();
    assert_eq!(first.aggregated[&Timeframe::OneHour], 1);

    // Feed down for two and a half hours
    fetcher.set_offline(true);
    for _ in 0..30 {
        clock.advance(chrono::Duration::minutes(5));
        assert!(scheduler.run_cycle().await.is_err());
    }
    assert_eq!(scheduler.retry_state().await.consecutive_failures, 30);

    fetcher.set_offline(false);
    fetcher.script(
        Some(raw(at(14, 0), dec!(1.0870))),
        raw_series(at(10, 0), at(14, 0)),
    );
    clock.set(at(14, 0) + chrono::Duration::seconds(30));

    let recovery = scheduler.run_cycle().await.unwrap();
    assert!(recovery.gap_filled);
    assert_eq!(recovery.ingest.earliest_written, Some(at(11, 5)));
    assert_eq!(recovery.aggregated[&Timeframe::OneHour], 3);
    assert_eq!(scheduler.retry_state().await.consecutive_failures, 0);

    let hourly = store
        .find_by_range(PAIR, Timeframe::OneHour, at(0, 0), at(23, 0), 100)
        .await
        .unwrap();
    let hours: Vec<u32> = hourly.iter().map(|bar| bar.timestamp.hour()).collect();
    assert_eq!(hours, vec![10, 11, 12, 13]);
    assert_eq!(
        store.count_bars(PAIR, Timeframe::FiveMinute).await.unwrap(),
        49
    );
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_cycle() {
    let store = Arc::new(TestStore::new());
    let fetcher = ScriptedFetcher::new(
        Some(raw(at(11, 0), dec!(1.0865))),
        raw_series(at(10, 0), at(11, 0)),
    );
    let mut config = scheduler_config();
    config.indicators.specs = vec![IndicatorSpec::new(IndicatorKind::Sma, 2)];
    let scheduler = build_scheduler(
        &config,
        store.clone(),
        fetcher,
        ManualClock::new(at(11, 0) + chrono::Duration::seconds(30)),
    );

    store.hold_next_indicator_write();
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.start().await })
    };
    store.held.notified().await;

    let stopper = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.stop().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The cycle is parked mid-computation, so stop() must still be waiting
    assert!(!stopper.is_finished());
    assert_eq!(scheduler.status().await, SchedulerStatus::Stopping);
    assert_eq!(
        store.count_calculated(PAIR, Timeframe::FiveMinute, 1).await.unwrap(),
        0
    );

    store.release.notify_one();
    stopper.await.unwrap();

    // Once stop() returns the cycle has finished: every stored value is flagged
    let raw_bars = store
        .find_by_range(PAIR, Timeframe::FiveMinute, at(0, 0), at(23, 0), 100)
        .await
        .unwrap();
    let mut flagged = 0;
    for bar in &raw_bars {
        let record = store
            .find_indicators(PAIR, Timeframe::FiveMinute, bar.timestamp)
            .await
            .unwrap();
        assert_eq!(bar.calculated, record.is_some());
        if bar.calculated {
            flagged += 1;
        }
    }
    assert_eq!(flagged, raw_bars.len() - 1);

    runner.await.unwrap().unwrap();
    assert_eq!(scheduler.status().await, SchedulerStatus::Stopped);
    assert_eq!(scheduler.get_stats().await.successful_cycles, 1);
}

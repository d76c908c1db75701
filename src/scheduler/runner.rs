/// Self-healing pipeline scheduler
///
/// One scheduler drives one pair: fetch the latest raw bar, aggregate the
/// derived timeframes, then drain the indicator backlog. At most one cycle
/// runs at a time. Fetch and raw persistence failures count towards the
/// critical ceiling; aggregation and computation failures are recorded per
/// timeframe and do not fail the cycle.
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, SchedulerSettings};
use crate::data::{Aggregator, BacklogTracker, BarStore, Fetcher, RawBarIngestor};
use crate::error::{PipelineError, Result, RetryClass};
use crate::indicators::IndicatorComputer;
use crate::scheduler::state::{
    CycleReport, HealthReport, HealthStatus, RetryState, RuntimeState, SchedulerStats,
    SchedulerStatus, StageFailure,
};
use crate::time::{parse_period, Clock};
use crate::types::Timeframe;

pub struct Scheduler {
    pair: String,
    settings: SchedulerSettings,
    batch_size: usize,
    store: Arc<dyn BarStore>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    ingestor: RawBarIngestor,
    aggregator: Arc<Aggregator>,
    backlog: Arc<BacklogTracker>,
    computer: IndicatorComputer,
    state: RwLock<RuntimeState>,
    cycle_lock: Mutex<()>,
    stop_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn BarStore>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let tz = config.timezone()?;
        let pair = config.pair.clone();

        let aggregator = Arc::new(Aggregator::new(
            pair.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.aggregation.clone(),
            tz,
        ));
        let backlog = Arc::new(BacklogTracker::new(
            pair.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.indicators.version,
            config.indicators.batch_size,
        ));
        let computer = IndicatorComputer::new(
            pair.clone(),
            Arc::clone(&store),
            Arc::clone(&backlog),
            Arc::clone(&clock),
            config.indicators.clone(),
        );
        let ingestor = RawBarIngestor::new(pair.clone(), Arc::clone(&store));
        let (stop_tx, _) = watch::channel(false);

        Ok(Scheduler {
            pair,
            settings: config.scheduler.clone(),
            batch_size: config.indicators.batch_size,
            store,
            fetcher,
            clock,
            ingestor,
            aggregator,
            backlog,
            computer,
            state: RwLock::new(RuntimeState::new(config.scheduler.stats_window)),
            cycle_lock: Mutex::new(()),
            stop_tx,
        })
    }

    pub fn backlog(&self) -> Arc<BacklogTracker> {
        Arc::clone(&self.backlog)
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.state.read().await.status
    }

    pub async fn retry_state(&self) -> RetryState {
        self.state.read().await.retry.clone()
    }

    /// Bootstrap, then run cycles until `stop()` or the failure ceiling.
    ///
    /// A concurrent second call returns immediately. Fails if the scheduler
    /// is critical or the bootstrap store probe fails.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match state.status {
                SchedulerStatus::Critical => {
                    return Err(PipelineError::SchedulerState(format!(
                        "scheduler for {} is critical: {}",
                        self.pair,
                        state.retry.last_error.clone().unwrap_or_default()
                    )));
                }
                status if status.is_active() => {
                    warn!("Scheduler for {} already {}; ignoring start", self.pair, status);
                    return Ok(());
                }
                _ => {}
            }
            state.status = SchedulerStatus::Starting;
            state.started_at = Some(self.clock.now());
            state.run_id = Some(Uuid::new_v4().to_string());
            info!(
                "Starting scheduler for {} every {}m (run {})",
                self.pair,
                self.settings.interval_minutes,
                state.run_id.as_deref().unwrap_or_default()
            );
        }
        self.stop_tx.send_replace(false);

        if let Err(e) = self.bootstrap().await {
            error!("Bootstrap failed: {} ({})", e, e.error_code());
            let mut state = self.state.write().await;
            state.status = SchedulerStatus::Stopped;
            state.retry.running = false;
            state.retry.last_error = Some(e.to_string());
            return Err(e);
        }

        {
            let mut state = self.state.write().await;
            if state.status == SchedulerStatus::Starting {
                state.status = SchedulerStatus::Running;
                state.retry.running = true;
            }
        }

        self.run_loop().await;
        Ok(())
    }

    /// Ask the loop to exit and wait for any in-flight cycle to finish
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            match state.status {
                SchedulerStatus::Starting | SchedulerStatus::Running => {
                    info!("Stopping scheduler for {} after the current cycle", self.pair);
                    state.status = SchedulerStatus::Stopping;
                }
                status => debug!("stop() while {}", status),
            }
        }

        self.stop_tx.send_replace(true);
        let _idle = self.cycle_lock.lock().await;
    }

    async fn bootstrap(&self) -> Result<()> {
        let last = self.store.latest(&self.pair, Timeframe::FiveMinute).await?;
        match &last {
            Some(bar) => info!("Last stored raw bar for {}: {}", self.pair, bar.timestamp),
            None => info!("No raw bars stored yet for {}", self.pair),
        }

        let Some(period) = self.settings.bootstrap_period.as_deref() else {
            return Ok(());
        };
        let span = parse_period(period)?;

        let rows = match self
            .fetch_with_retry("bootstrap fetch", || {
                self.fetcher.get_historical(&self.pair, period, "5m")
            })
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Bootstrap fetch failed, continuing: {} ({})", e, e.error_code());
                return Ok(());
            }
        };

        match self.ingestor.ingest(&rows).await {
            Ok(report) => info!(
                "Bootstrapped {} raw bars for {} ({} new)",
                report.received, self.pair, report.inserted
            ),
            Err(e) => {
                warn!("Bootstrap ingest failed, continuing: {} ({})", e, e.error_code());
                return Ok(());
            }
        }

        let now = self.clock.now();
        for timeframe in Timeframe::derived() {
            match self.aggregator.backfill(timeframe, now - span, now).await {
                Ok(bars) => debug!("Bootstrapped {} {} bars", bars.len(), timeframe),
                Err(e) => warn!("Bootstrap {} backfill failed: {}", timeframe, e),
            }
        }

        Ok(())
    }

    async fn run_loop(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = Duration::from_secs(self.settings.interval_minutes * 60);

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(_) | Err(PipelineError::CycleInProgress) => interval,
                Err(e) => {
                    if self.status().await == SchedulerStatus::Critical {
                        break;
                    }
                    self.retry_delay(&e)
                }
            };

            debug!("Next cycle for {} in {:?}", self.pair, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => {}
            }
        }

        let mut state = self.state.write().await;
        state.retry.running = false;
        if state.status != SchedulerStatus::Critical {
            state.status = SchedulerStatus::Stopped;
            info!("Scheduler for {} stopped", self.pair);
        }
    }

    fn retry_delay(&self, error: &PipelineError) -> Duration {
        let base = Duration::from_secs(self.settings.retry_delay_seconds);
        match error.retry_class() {
            RetryClass::Extended => base * self.settings.network_backoff_multiplier.max(1),
            RetryClass::Standard | RetryClass::None => base,
        }
    }

    /// Retry network-class failures with a doubling delay from 1s
    async fn fetch_with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.settings.max_retries.max(1);
        let mut delay = Duration::from_secs(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && e.retry_class() == RetryClass::Extended => {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one cycle now. Returns `CycleInProgress` if another is in flight.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("Cycle for {} already in flight; skipping", self.pair);
            return Err(PipelineError::CycleInProgress);
        };

        if self.status().await == SchedulerStatus::Critical {
            return Err(PipelineError::SchedulerState(format!(
                "scheduler for {} is critical",
                self.pair
            )));
        }

        let started = Instant::now();
        let mut report = CycleReport {
            started_at: Some(self.clock.now()),
            ..CycleReport::default()
        };

        let result = self.execute_cycle(&mut report).await;
        let elapsed = started.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;

        match result {
            Ok(()) => {
                self.record_success(elapsed).await;
                info!(
                    "Cycle for {} done in {}ms: {} raw written, aggregated {:?}, {} computed, {} stage failures",
                    self.pair,
                    report.duration_ms,
                    report.ingest.written(),
                    report.aggregated,
                    report.processed(),
                    report.failures.len()
                );
                Ok(report)
            }
            Err(e) => {
                self.record_failure(&e, elapsed).await;
                Err(e)
            }
        }
    }

    async fn execute_cycle(&self, report: &mut CycleReport) -> Result<()> {
        let latest = self
            .fetch_with_retry("latest fetch", || self.fetcher.get_latest(&self.pair))
            .await?;

        match latest {
            Some(raw) => {
                let last_stored = self.store.latest(&self.pair, Timeframe::FiveMinute).await?;
                let interval = chrono::Duration::minutes(self.settings.interval_minutes as i64);
                let needs_gap_fill = match &last_stored {
                    Some(last) => raw.timestamp - last.timestamp > interval,
                    None => true,
                };

                let mut rows = Vec::new();
                if needs_gap_fill {
                    info!(
                        "Gap before {} for {}; fetching {} of history",
                        raw.timestamp, self.pair, self.settings.gap_fill_period
                    );
                    rows = self
                        .fetch_with_retry("gap fill", || {
                            self.fetcher.get_historical(
                                &self.pair,
                                &self.settings.gap_fill_period,
                                "5m",
                            )
                        })
                        .await?;
                    report.gap_filled = true;
                }
                rows.push(raw);

                report.ingest = self.ingestor.ingest(&rows).await?;
            }
            None => debug!("No new raw bar for {}", self.pair),
        }

        // Raw bars are durable from here on. Windows holding bars written by
        // a gap fill are rebuilt along with the last closed ones.
        let changed_since = report.ingest.earliest_written;
        for timeframe in Timeframe::derived() {
            match self.aggregator.aggregate_since(timeframe, changed_since).await {
                Ok(bars) => {
                    report.aggregated.insert(timeframe, bars.len());
                }
                Err(e) => self.record_stage_failure(report, "aggregate", Some(timeframe), &e),
            }
        }

        let pending = match self.backlog.detect_differences().await {
            Ok(pending) => pending,
            Err(e) => {
                self.record_stage_failure(report, "backlog", None, &e);
                return Ok(());
            }
        };

        for (timeframe, count) in &pending {
            if *count == 0 {
                continue;
            }
            match self.computer.compute(*timeframe, self.batch_size).await {
                Ok(computed) => {
                    report.computed.insert(*timeframe, computed);
                }
                Err(e) => self.record_stage_failure(report, "compute", Some(*timeframe), &e),
            }
        }
        report.pending = pending;

        Ok(())
    }

    fn record_stage_failure(
        &self,
        report: &mut CycleReport,
        stage: &str,
        timeframe: Option<Timeframe>,
        e: &PipelineError,
    ) {
        let label = timeframe.map(|tf| tf.as_str()).unwrap_or("all");
        if e.is_benign() {
            debug!("{} {} for {}: {}", stage, label, self.pair, e);
        } else {
            error!("{} {} failed for {}: {} ({})", stage, label, self.pair, e, e.error_code());
        }

        report.failures.push(StageFailure {
            stage: stage.to_string(),
            timeframe,
            code: e.error_code().to_string(),
            message: e.to_string(),
        });
    }

    async fn record_success(&self, elapsed: Duration) {
        let mut state = self.state.write().await;
        if state.retry.consecutive_failures > 0 {
            info!(
                "{} recovered after {} failed cycles",
                self.pair, state.retry.consecutive_failures
            );
        }
        state.retry.consecutive_failures = 0;
        state.retry.last_success_at = Some(self.clock.now());
        state.stats.record(elapsed, true);
    }

    async fn record_failure(&self, e: &PipelineError, elapsed: Duration) {
        let mut state = self.state.write().await;
        state.retry.consecutive_failures += 1;
        state.retry.last_error = Some(format!("{} ({})", e, e.error_code()));
        state.stats.record(elapsed, false);

        let failures = state.retry.consecutive_failures;
        error!(
            "Cycle for {} failed ({}/{}): {} ({})",
            self.pair,
            failures,
            self.settings.max_consecutive_failures,
            e,
            e.error_code()
        );

        if failures >= self.settings.max_consecutive_failures || e.is_fatal() {
            error!(
                "Scheduler for {} is critical after {} consecutive failures; stopping",
                self.pair, failures
            );
            state.status = SchedulerStatus::Critical;
            state.retry.running = false;
            self.stop_tx.send_replace(true);
        }
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let state = self.state.read().await;
        let uptime_seconds = state
            .started_at
            .map(|started| (self.clock.now() - started).num_seconds())
            .unwrap_or(0);

        SchedulerStats {
            status: state.status,
            run_id: state.run_id.clone(),
            total_cycles: state.stats.total,
            successful_cycles: state.stats.successful,
            failed_cycles: state.stats.failed,
            success_rate: state.stats.success_rate(),
            average_cycle_ms: state.stats.average_ms(),
            consecutive_failures: state.retry.consecutive_failures,
            last_error: state.retry.last_error.clone(),
            last_success_at: state.retry.last_success_at,
            started_at: state.started_at,
            uptime_seconds,
        }
    }

    /// Structured health with the reasons behind anything but `healthy`
    pub async fn health_check(&self) -> HealthReport {
        let (status, retry) = {
            let state = self.state.read().await;
            (state.status, state.retry.clone())
        };
        let now = self.clock.now();
        let mut reasons = Vec::new();

        let pending = match self.backlog.detect_differences().await {
            Ok(pending) => pending,
            Err(e) => {
                reasons.push(format!("store unreachable: {}", e));
                BTreeMap::new()
            }
        };

        let health = match status {
            SchedulerStatus::Critical => {
                reasons.insert(
                    0,
                    format!(
                        "{} consecutive failures, last error: {}",
                        retry.consecutive_failures,
                        retry.last_error.as_deref().unwrap_or("unknown")
                    ),
                );
                HealthStatus::Critical
            }
            SchedulerStatus::Stopped => {
                reasons.push("scheduler is not running".to_string());
                HealthStatus::Stopped
            }
            _ => {
                if retry.consecutive_failures >= self.settings.degraded_after_failures.max(1) {
                    reasons.push(format!(
                        "{} consecutive failures, last error: {}",
                        retry.consecutive_failures,
                        retry.last_error.as_deref().unwrap_or("unknown")
                    ));
                }
                let stale_after =
                    chrono::Duration::minutes(self.settings.interval_minutes as i64 * 3);
                if let Some(last) = retry.last_success_at {
                    if now - last > stale_after {
                        reasons.push(format!("no successful cycle since {}", last));
                    }
                }

                if reasons.is_empty() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                }
            }
        };

        HealthReport {
            status: health,
            scheduler: status,
            reasons,
            consecutive_failures: retry.consecutive_failures,
            pending,
            checked_at: now,
        }
    }
}

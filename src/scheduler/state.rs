/// Scheduler lifecycle, retry state and reporting types
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::IngestReport;
use crate::indicators::ComputeReport;
use crate::types::Timeframe;

/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with `Critical`
/// reachable from `Running` and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Critical,
}

impl SchedulerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStatus::Stopped => "stopped",
            SchedulerStatus::Starting => "starting",
            SchedulerStatus::Running => "running",
            SchedulerStatus::Stopping => "stopping",
            SchedulerStatus::Critical => "critical",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SchedulerStatus::Starting | SchedulerStatus::Running | SchedulerStatus::Stopping
        )
    }
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported health, coarser than the lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Stopped,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
            HealthStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Failure caught inside a cycle without failing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub timeframe: Option<Timeframe>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub gap_filled: bool,
    pub ingest: IngestReport,
    /// Derived bars produced per timeframe
    pub aggregated: BTreeMap<Timeframe, usize>,
    pub pending: BTreeMap<Timeframe, usize>,
    pub computed: BTreeMap<Timeframe, ComputeReport>,
    pub failures: Vec<StageFailure>,
}

impl CycleReport {
    pub fn processed(&self) -> usize {
        self.computed.values().map(|r| r.processed).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub status: SchedulerStatus,
    /// Identifies the current (or last) `start()` in logs
    pub run_id: Option<String>,
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub success_rate: f64,
    /// Rolling average over the last `stats_window` cycles
    pub average_cycle_ms: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub scheduler: SchedulerStatus,
    pub reasons: Vec<String>,
    pub consecutive_failures: u32,
    pub pending: BTreeMap<Timeframe, usize>,
    pub checked_at: DateTime<Utc>,
}

/// Cycle counters with a bounded window of recent durations
#[derive(Debug, Clone, Default)]
pub(crate) struct CycleStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    durations: VecDeque<Duration>,
    window: usize,
}

impl CycleStats {
    pub fn new(window: usize) -> Self {
        CycleStats {
            window: window.max(1),
            ..CycleStats::default()
        }
    }

    pub fn record(&mut self, duration: Duration, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }

        if self.durations.len() == self.window {
            self.durations.pop_front();
        }
        self.durations.push_back(duration);
    }

    pub fn average_ms(&self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        let total: Duration = self.durations.iter().sum();
        total.as_secs_f64() * 1000.0 / self.durations.len() as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total as f64 * 100.0
    }
}

/// Everything the scheduler mutates, kept behind one lock
#[derive(Debug, Clone)]
pub(crate) struct RuntimeState {
    pub status: SchedulerStatus,
    pub retry: RetryState,
    pub stats: CycleStats,
    pub started_at: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
}

impl RuntimeState {
    pub fn new(stats_window: usize) -> Self {
        RuntimeState {
            status: SchedulerStatus::Stopped,
            retry: RetryState::default(),
            stats: CycleStats::new(stats_window),
            started_at: None,
            run_id: None,
        }
    }
}

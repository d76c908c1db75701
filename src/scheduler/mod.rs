pub mod runner;
pub mod state;

pub use runner::Scheduler;
pub use state::{
    CycleReport, HealthReport, HealthStatus, RetryState, SchedulerStats, SchedulerStatus,
    StageFailure,
};

/// Centralized error types for the aggregation pipeline
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    // Data Errors
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Stale calculation version: {0}")]
    StaleVersion(String),

    // Store Errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // Network Errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    // Scheduler Errors
    #[error("Invalid scheduler state: {0}")]
    SchedulerState(String),

    #[error("Cycle already in progress")]
    CycleInProgress,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// How the scheduler should back off after a failed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry after the configured `retry_delay_seconds`
    Standard,
    /// Network or rate-limit trouble: retry after the extended delay
    Extended,
    /// Not worth retrying within this process
    None,
}

impl PipelineError {
    /// Check if the failed operation can be attempted again
    pub fn is_retryable(&self) -> bool {
        !matches!(self.retry_class(), RetryClass::None)
    }

    /// Check if error should stop the scheduler immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_) | PipelineError::ConfigSource(_) | PipelineError::Internal(_)
        )
    }

    /// Expected steady-state outcome rather than a fault
    pub fn is_benign(&self) -> bool {
        matches!(self, PipelineError::InsufficientData(_))
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            PipelineError::Network(_) | PipelineError::Http(_) | PipelineError::RateLimit(_) => {
                RetryClass::Extended
            }
            PipelineError::Store(_)
            | PipelineError::StoreIo(_)
            | PipelineError::Serialization(_)
            | PipelineError::CycleInProgress => RetryClass::Standard,
            PipelineError::InsufficientData(_)
            | PipelineError::Validation(_)
            | PipelineError::StaleVersion(_) => RetryClass::Standard,
            PipelineError::Config(_)
            | PipelineError::ConfigSource(_)
            | PipelineError::SchedulerState(_)
            | PipelineError::Internal(_) => RetryClass::None,
        }
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            PipelineError::InsufficientData(_) => "DATA_001",
            PipelineError::Validation(_) => "DATA_002",
            PipelineError::StaleVersion(_) => "DATA_003",
            PipelineError::Store(_) => "STORE_001",
            PipelineError::StoreIo(_) => "STORE_002",
            PipelineError::Serialization(_) => "STORE_003",
            PipelineError::Network(_) => "NET_001",
            PipelineError::Http(_) => "NET_002",
            PipelineError::RateLimit(_) => "NET_003",
            PipelineError::Config(_) => "CFG_001",
            PipelineError::ConfigSource(_) => "CFG_002",
            PipelineError::SchedulerState(_) => "SCHED_001",
            PipelineError::CycleInProgress => "SCHED_002",
            PipelineError::Internal(_) => "INT_001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_use_extended_backoff() {
        assert_eq!(
            PipelineError::Network("reset".to_string()).retry_class(),
            RetryClass::Extended
        );
        assert_eq!(
            PipelineError::RateLimit("429".to_string()).retry_class(),
            RetryClass::Extended
        );
        assert_eq!(
            PipelineError::Store("locked".to_string()).retry_class(),
            RetryClass::Standard
        );
    }

    #[test]
    fn test_config_errors_are_fatal() {
        let err = PipelineError::Config("bad timezone".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.error_code(), "CFG_001");
    }

    #[test]
    fn test_insufficient_data_is_benign() {
        assert!(PipelineError::InsufficientData("5 < 12".to_string()).is_benign());
        assert!(!PipelineError::Store("down".to_string()).is_benign());
    }
}

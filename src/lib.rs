pub mod types;
pub mod error;
pub mod config;
pub mod time;
pub mod utils;
pub mod data;
pub mod indicators;
pub mod scheduler;

pub use types::*;
pub use error::{PipelineError, Result};
pub use config::PipelineConfig;

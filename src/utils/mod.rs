pub mod logging;
pub mod rate_limiter;

pub use logging::init_tracing;
pub use rate_limiter::RateLimiter;

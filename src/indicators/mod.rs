pub mod calc;
pub mod computer;

pub use calc::{calculate_adx, calculate_atr, calculate_ema, calculate_rsi, calculate_sma, Adx, Ohlc};
pub use computer::{evaluate, ComputeReport, IndicatorComputer};

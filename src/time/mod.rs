pub mod clock;
pub mod windows;

pub use clock::{Clock, ManualClock, SystemClock};
pub use windows::{
    last_closed_windows, parse_period, window_end, window_start, windows_between,
};

mod clock;
mod tick;

pub use clock::{MockClock, init_global_with_mock, now_ms};
pub use tick::{TIMER_LOOK_BACK, Tick};

//! Time source, injected so retry delays and retention can be driven from tests.

use std::time::Duration;

use chrono::{DateTime, Utc};

#[cfg_attr(test, mockall::automock)]
pub trait ClockPort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// `now() + delay`, saturating at the far end of the calendar.
    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let now = self.now();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Oldest instant still inside a trailing `window`.
    fn window_start(&self, window: Duration) -> DateTime<Utc> {
        let now = self.now();
        chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

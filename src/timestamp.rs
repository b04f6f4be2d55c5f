/// Time window bracketing an operation, for checking timestamps the mounted
/// filesystem assigns (mtime/ctime/atime) against the wall clock.
///
/// The filesystem under test stamps inodes from a coarse realtime clock, so
/// both edges of the window are padded by a settle delay.
use std::time::{Duration, SystemTime};

/// Default padding applied before and after the bracketed operation.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampWindow {
    pub start: SystemTime,
    pub end: SystemTime,
}

impl TimestampWindow {
    /// Run `op` inside a window padded by `settle` on both sides.
    pub fn around<T>(settle: Duration, op: impl FnOnce() -> T) -> (T, TimestampWindow) {
        let start = SystemTime::now();
        std::thread::sleep(settle);
        let value = op();
        std::thread::sleep(settle);
        let end = SystemTime::now();
        (value, TimestampWindow { start, end })
    }

    /// Async flavour of [`TimestampWindow::around`] for use inside a runtime.
    pub async fn around_async<T, F>(settle: Duration, op: F) -> (T, TimestampWindow)
    where
        F: std::future::Future<Output = T>,
    {
        let start = SystemTime::now();
        tokio::time::sleep(settle).await;
        let value = op.await;
        tokio::time::sleep(settle).await;
        let end = SystemTime::now();
        (value, TimestampWindow { start, end })
    }

    /// True iff `start <= t <= end`.
    ///
    /// Accepts anything convertible to `SystemTime`, including file metadata
    /// times and `chrono::DateTime<Utc>`.
    pub fn contains(&self, t: impl Into<SystemTime>) -> bool {
        let t = t.into();
        self.start <= t && t <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

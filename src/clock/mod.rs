use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source for everything exchanged with the server.
#[cfg_attr(test, mockall::automock)]
pub trait LocalClock {
    /// Milliseconds since the Unix epoch, with sub-millisecond fraction.
    fn now_ms(&self) -> f64;
}

/// `LocalClock` backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl LocalClock for SystemWallClock {
    fn now_ms(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

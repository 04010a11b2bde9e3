use thiserror::Error;

/// Failures the sync loop reports but survives.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("clock sync request {request_id} timed out after {waited_ms:.0}ms")]
    ClockSyncTimeout { request_id: u64, waited_ms: f64 },

    #[error("scheduler fell behind, skipped {missed} beat(s)")]
    SchedulerUnderrun { missed: u64 },

    #[error("audio engine unavailable: {0}")]
    AudioEngineUnavailable(String),

    #[error("metronome change rejected: {0}")]
    LeaderAuthorization(String),

    #[error("stale {kind} response {request_id} (latest is {latest:?})")]
    StaleResponse {
        kind: &'static str,
        request_id: u64,
        latest: Option<u64>,
    },

    #[error("tempo {0} BPM outside 30..=300")]
    InvalidTempo(u16),

    #[error("{0} beats per measure outside 1..=16")]
    InvalidMeter(u8),
}

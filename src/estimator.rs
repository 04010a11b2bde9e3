use log::{debug, info, warn};

use crate::error::SyncError;
use crate::protocol::Request;
use crate::smoothing::Ewma;

struct PendingSync {
    request_id: u64,
    t0: f64,
}

/// Tracks this client's offset from the server wall clock
/// (`server time - local time`, in ms).
pub struct ClockSyncEstimator {
    offset_ms: f64,
    filter: Ewma,
    pending: Option<PendingSync>,
    timeout_ms: f64,
    samples: u64,
    last_rtt_ms: Option<f64>,
}

impl ClockSyncEstimator {
    /// `smoothing` is the EWMA weight of each new sample; 1.0 keeps only the latest.
    pub fn new(timeout_ms: f64, smoothing: f64) -> Self {
        ClockSyncEstimator {
            offset_ms: 0.0,
            filter: Ewma::new(smoothing),
            pending: None,
            timeout_ms,
            samples: 0,
            last_rtt_ms: None,
        }
    }

    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    pub fn server_now(&self, local_now_ms: f64) -> f64 {
        local_now_ms + self.offset_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn last_rtt_ms(&self) -> Option<f64> {
        self.last_rtt_ms
    }

    #[cfg(test)]
    fn in_flight(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.request_id)
    }

    /// Start a sync cycle. Any older request still in flight becomes stale.
    pub fn begin(&mut self, request_id: u64, now_ms: f64) -> Request {
        if let Some(old) = self.pending.replace(PendingSync { request_id, t0: now_ms }) {
            debug!("[ClockSync] Request {} superseded by {}", old.request_id, request_id);
        }
        Request::SyncTime { t0: now_ms }
    }

    /// Apply a `syncTime` reply carrying server time `t1`, received at local `t3`.
    pub fn on_reply(&mut self, request_id: u64, t1: f64, t3: f64) -> Result<f64, SyncError> {
        let pending = match self.pending.take() {
            Some(p) if p.request_id == request_id => p,
            other => {
                let latest = other.as_ref().map(|p| p.request_id);
                self.pending = other;
                return Err(SyncError::StaleResponse {
                    kind: "syncTime",
                    request_id,
                    latest,
                });
            }
        };

        let rtt = t3 - pending.t0;
        let estimated_server_time = t1 + rtt / 2.0;
        let raw_offset = estimated_server_time - t3;

        self.offset_ms = self.filter.sample(raw_offset);
        self.samples += 1;
        self.last_rtt_ms = Some(rtt);

        info!(
            "[ClockSync] Offset {:+.1}ms (raw {:+.1}ms, rtt {:.1}ms)",
            self.offset_ms, raw_offset, rtt
        );
        Ok(self.offset_ms)
    }

    /// Expire the in-flight request once it has waited past the timeout.
    /// The previous offset stays in effect.
    pub fn check_timeout(&mut self, now_ms: f64) -> Option<SyncError> {
        let waited_ms = now_ms - self.pending.as_ref()?.t0;
        if waited_ms < self.timeout_ms {
            return None;
        }
        let request_id = self.pending.take()?.request_id;
        let err = SyncError::ClockSyncTimeout { request_id, waited_ms };
        warn!("[ClockSync] {}. Keeping offset {:+.1}ms", err, self.offset_ms);
        Some(err)
    }
}

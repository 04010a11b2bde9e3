use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::SyncError;
use crate::protocol::{ParticipantId, Request};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencySample {
    pub rtt_ms: f64,
    pub one_way_ms: f64,
}

struct PendingPing {
    ping_id: u64,
    t0: f64,
}

/// Measures round trips to the server and holds what the server decides
/// in return: this client's sync offset and the peers' arrival estimates.
pub struct LatencyMonitor {
    next_ping_id: u64,
    pending: Option<PendingPing>,
    timeout_ms: f64,
    latest: Option<LatencySample>,
    sync_offset_ms: f64,
    stream_arrivals: HashMap<ParticipantId, f64>,
}

impl LatencyMonitor {
    pub fn new(timeout_ms: f64) -> Self {
        LatencyMonitor {
            next_ping_id: 1,
            pending: None,
            timeout_ms,
            latest: None,
            sync_offset_ms: 0.0,
            stream_arrivals: HashMap::new(),
        }
    }

    pub fn latest(&self) -> Option<LatencySample> {
        self.latest
    }

    pub fn sync_offset_ms(&self) -> f64 {
        self.sync_offset_ms
    }

    pub fn arrival_for(&self, participant: &str) -> Option<f64> {
        self.stream_arrivals.get(participant).copied()
    }

    pub fn stream_arrivals(&self) -> &HashMap<ParticipantId, f64> {
        &self.stream_arrivals
    }

    /// Start a probe. An unanswered older probe is abandoned.
    pub fn measure(&mut self, now_ms: f64) -> Request {
        let ping_id = self.next_ping_id;
        self.next_ping_id += 1;
        if let Some(old) = self.pending.replace(PendingPing { ping_id, t0: now_ms }) {
            debug!("[Latency] Ping {} abandoned for {}", old.ping_id, ping_id);
        }
        Request::PingServer { ping_id, t0: now_ms }
    }

    /// Handle the server's ack and produce the `recordServerLatency` report.
    pub fn on_ack(&mut self, ping_id: u64, now_ms: f64) -> Result<Request, SyncError> {
        let pending = match self.pending.take() {
            Some(p) if p.ping_id == ping_id => p,
            other => {
                let latest = other.as_ref().map(|p| p.ping_id);
                self.pending = other;
                return Err(SyncError::StaleResponse {
                    kind: "pingServer",
                    request_id: ping_id,
                    latest,
                });
            }
        };

        let rtt = (now_ms - pending.t0).max(0.0);
        let sample = LatencySample {
            rtt_ms: rtt,
            one_way_ms: rtt / 2.0,
        };
        self.latest = Some(sample);
        debug!("[Latency] rtt {:.1}ms, one-way {:.1}ms", sample.rtt_ms, sample.one_way_ms);
        Ok(Request::RecordServerLatency { rtt })
    }

    pub fn check_timeout(&mut self, now_ms: f64) -> bool {
        match &self.pending {
            Some(p) if now_ms - p.t0 >= self.timeout_ms => {
                warn!("[Latency] Ping {} unanswered after {:.0}ms", p.ping_id, now_ms - p.t0);
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Store a server-pushed sync offset and return the change in ms.
    pub fn apply_sync_offset(&mut self, sync_offset_ms: f64) -> f64 {
        let delta = sync_offset_ms - self.sync_offset_ms;
        if delta != 0.0 {
            info!(
                "[Latency] Sync offset {:.1}ms -> {:.1}ms",
                self.sync_offset_ms, sync_offset_ms
            );
        }
        self.sync_offset_ms = sync_offset_ms;
        delta
    }

    /// Replace the arrival estimates with the server's latest cascade result.
    pub fn set_stream_arrivals(&mut self, arrivals: HashMap<ParticipantId, f64>) {
        self.stream_arrivals = arrivals;
    }

    pub fn forget(&mut self, participant: &str) {
        self.stream_arrivals.remove(participant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_produces_report() {
        let mut mon = LatencyMonitor::new(2000.0);
        let ping = mon.measure(1_000.0);
        assert_eq!(ping, Request::PingServer { ping_id: 1, t0: 1_000.0 });

        let report = mon.on_ack(1, 1_064.0).unwrap();
        assert_eq!(report, Request::RecordServerLatency { rtt: 64.0 });
        assert_eq!(
            mon.latest(),
            Some(LatencySample { rtt_ms: 64.0, one_way_ms: 32.0 })
        );
    }

    #[test]
    fn test_newest_sample_replaces_old() {
        let mut mon = LatencyMonitor::new(2000.0);
        mon.measure(0.0);
        mon.on_ack(1, 80.0).unwrap();
        mon.measure(2_000.0);
        mon.on_ack(2, 2_020.0).unwrap();
        assert_eq!(mon.latest().unwrap().rtt_ms, 20.0);
    }

    #[test]
    fn test_out_of_order_ack_is_discarded() {
        let mut mon = LatencyMonitor::new(2000.0);
        mon.measure(0.0);
        mon.measure(10.0);
        assert!(matches!(
            mon.on_ack(1, 500.0),
            Err(SyncError::StaleResponse { latest: Some(2), .. })
        ));
        assert!(mon.latest().is_none());
        assert!(mon.on_ack(2, 40.0).is_ok());
    }

    #[test]
    fn test_timeout_clears_probe() {
        let mut mon = LatencyMonitor::new(2000.0);
        mon.measure(0.0);
        assert!(!mon.check_timeout(1_999.0));
        assert!(mon.check_timeout(2_000.0));
        assert!(mon.on_ack(1, 2_100.0).is_err());
    }

    #[test]
    fn test_sync_offset_delta() {
        let mut mon = LatencyMonitor::new(2000.0);
        assert_eq!(mon.apply_sync_offset(40.0), 40.0);
        assert_eq!(mon.apply_sync_offset(25.0), -15.0);
        assert_eq!(mon.sync_offset_ms(), 25.0);
    }

    #[test]
    fn test_stream_arrivals_replace_and_forget() {
        let mut mon = LatencyMonitor::new(2000.0);
        let mut arrivals = HashMap::new();
        arrivals.insert("alice".to_string(), 35.0);
        arrivals.insert("bob".to_string(), 80.0);
        mon.set_stream_arrivals(arrivals);
        assert_eq!(mon.arrival_for("bob"), Some(80.0));
        mon.forget("bob");
        assert_eq!(mon.arrival_for("bob"), None);
        assert_eq!(mon.stream_arrivals().len(), 1);
    }
}

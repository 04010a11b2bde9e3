use anyhow::Result;

use crate::protocol::{ClientMessage, ParticipantId, ServerMessage};

/// Reliable, ordered link to the room server.
#[cfg_attr(test, mockall::automock)]
pub trait SignalingChannel {
    fn send(&mut self, message: ClientMessage) -> Result<()>;

    /// Returns Ok(None) when nothing is waiting.
    fn try_recv(&mut self) -> Result<Option<ServerMessage>>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type GraphId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Suspended,
    Running,
    Closed,
}

/// The process-wide audio output. Times are audio-clock seconds.
#[cfg_attr(test, mockall::automock)]
pub trait AudioEngine {
    fn current_time(&self) -> f64;

    fn state(&self) -> EngineState;

    /// Only ever called in response to a user action.
    fn resume(&mut self) -> Result<()>;

    /// Prepare the click sample. Failure disables the metronome only.
    fn load_click(&mut self) -> Result<()>;

    /// Play one click exactly at `at`. Engines drop events already in the past.
    fn schedule_click(&mut self, at: f64, accent: bool) -> Result<()>;

    /// Build `source -> delay -> gain -> output` for a remote track. The
    /// source must keep decoding for as long as the graph exists.
    fn create_stream_graph(&mut self, track: &TrackHandle) -> Result<GraphId>;

    fn set_delay(&mut self, graph: GraphId, seconds: f64, time_constant: f64) -> Result<()>;

    fn set_gain(&mut self, graph: GraphId, gain: f64, time_constant: f64) -> Result<()>;

    fn destroy_stream_graph(&mut self, graph: GraphId) -> Result<()>;

    fn live_graphs(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackHandle {
    pub participant: ParticipantId,
    pub track_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    TrackAvailable(TrackHandle),
    TrackEnded(TrackHandle),
}

/// Delivery statistics for one inbound track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackStats {
    pub packets_lost: u64,
    pub jitter_buffer_delay_s: f64,
    pub round_trip_ms: Option<f64>,
}

/// Media plumbing owned elsewhere: capture, remote tracks, stats.
#[cfg_attr(test, mockall::automock)]
pub trait MediaTransport {
    fn poll_event(&mut self) -> Option<MediaEvent>;

    fn track_stats(&self, track: &TrackHandle) -> Result<TrackStats>;

    fn stop_capture(&mut self) -> Result<()>;
}

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;

use crate::protocol::ParticipantId;
use crate::traits::{AudioEngine, GraphId, TrackHandle};

pub const MAX_DELAY_S: f64 = 2.0;

/// Delay that lines a peer's stream up with our beat grid, clamped to
/// `[0, max_delay_s]`. Non-numeric input gives zero.
pub fn required_delay_seconds(sync_offset_ms: f64, arrival_ms: f64, max_delay_s: f64) -> f64 {
    let delay = (sync_offset_ms - arrival_ms) / 1000.0;
    if delay.is_nan() {
        return 0.0;
    }
    delay.clamp(0.0, max_delay_s.max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompensatorConfig {
    pub max_delay_s: f64,
    /// Time constant for delay and gain ramps (s).
    pub smoothing_s: f64,
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        CompensatorConfig {
            max_delay_s: MAX_DELAY_S,
            smoothing_s: 0.075,
        }
    }
}

/// Live audio graph for one remote stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensatorGraph {
    pub graph: GraphId,
    pub delay_s: f64,
    pub gain: f64,
}

/// Delay + gain stage for one remote participant's stream.
pub struct StreamAlignmentCompensator {
    track: TrackHandle,
    config: CompensatorConfig,
    volume: u8,
    muted: bool,
    graph: Option<CompensatorGraph>,
}

impl StreamAlignmentCompensator {
    pub fn new(track: TrackHandle, config: CompensatorConfig, volume: u8) -> Self {
        StreamAlignmentCompensator {
            track,
            config,
            volume: volume.min(100),
            muted: false,
            graph: None,
        }
    }

    pub fn track(&self) -> &TrackHandle {
        &self.track
    }

    pub fn graph(&self) -> Option<&CompensatorGraph> {
        self.graph.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.graph.is_some()
    }

    fn target_gain(&self) -> f64 {
        if self.muted {
            0.0
        } else {
            self.volume as f64 / 100.0
        }
    }

    /// Build the graph, or retarget it if one already exists.
    pub fn attach(&mut self, engine: &mut dyn AudioEngine, arrival_ms: f64, sync_offset_ms: f64) -> Result<()> {
        if self.graph.is_some() {
            self.retarget(engine, arrival_ms, sync_offset_ms)?;
            return Ok(());
        }
        let delay_s = required_delay_seconds(sync_offset_ms, arrival_ms, self.config.max_delay_s);
        let gain = self.target_gain();

        let graph = engine.create_stream_graph(&self.track)?;
        // No signal has passed yet, so the first values are set directly.
        let configured = engine
            .set_delay(graph, delay_s, 0.0)
            .and_then(|_| engine.set_gain(graph, gain, 0.0));
        if let Err(e) = configured {
            engine.destroy_stream_graph(graph)?;
            return Err(e);
        }

        info!(
            "[Compensator] {} attached: delay {:.1}ms, gain {:.2}",
            self.track.participant,
            delay_s * 1000.0,
            gain
        );
        self.graph = Some(CompensatorGraph { graph, delay_s, gain });
        Ok(())
    }

    /// Ramp the delay toward a new target. Returns the target in seconds.
    pub fn retarget(&mut self, engine: &mut dyn AudioEngine, arrival_ms: f64, sync_offset_ms: f64) -> Result<f64> {
        let delay_s = required_delay_seconds(sync_offset_ms, arrival_ms, self.config.max_delay_s);
        let Some(g) = self.graph.as_mut() else {
            return Ok(delay_s);
        };
        if (g.delay_s - delay_s).abs() > 1e-6 {
            engine.set_delay(g.graph, delay_s, self.config.smoothing_s)?;
            debug!(
                "[Compensator] {} delay {:.1}ms -> {:.1}ms",
                self.track.participant,
                g.delay_s * 1000.0,
                delay_s * 1000.0
            );
            g.delay_s = delay_s;
        }
        Ok(delay_s)
    }

    /// Volume 0..=100.
    pub fn set_volume(&mut self, engine: &mut dyn AudioEngine, volume: u8) -> Result<()> {
        self.volume = volume.min(100);
        self.apply_gain(engine)
    }

    /// Muting only ramps the gain; the source stays connected and decoding.
    pub fn set_muted(&mut self, engine: &mut dyn AudioEngine, muted: bool) -> Result<()> {
        self.muted = muted;
        self.apply_gain(engine)
    }

    fn apply_gain(&mut self, engine: &mut dyn AudioEngine) -> Result<()> {
        let gain = self.target_gain();
        if let Some(g) = self.graph.as_mut() {
            engine.set_gain(g.graph, gain, self.config.smoothing_s)?;
            g.gain = gain;
        }
        Ok(())
    }

    /// Tear the graph down. Safe to call more than once.
    pub fn detach(&mut self, engine: &mut dyn AudioEngine) -> Result<()> {
        if let Some(g) = self.graph.take() {
            engine.destroy_stream_graph(g.graph)?;
            info!("[Compensator] {} detached", self.track.participant);
        }
        Ok(())
    }
}

/// All compensators, one per remote participant.
pub struct CompensatorSet {
    config: CompensatorConfig,
    default_volume: u8,
    by_participant: HashMap<ParticipantId, StreamAlignmentCompensator>,
}

impl CompensatorSet {
    pub fn new(config: CompensatorConfig, default_volume: u8) -> Self {
        CompensatorSet {
            config,
            default_volume,
            by_participant: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_participant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_participant.is_empty()
    }

    pub fn get(&self, participant: &str) -> Option<&StreamAlignmentCompensator> {
        self.by_participant.get(participant)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackHandle> {
        self.by_participant.values().map(|c| c.track())
    }

    /// A remote track became available. Without an arrival estimate yet the
    /// stream starts undelayed.
    pub fn track_available(
        &mut self,
        engine: &mut dyn AudioEngine,
        track: TrackHandle,
        arrival_ms: Option<f64>,
        sync_offset_ms: f64,
    ) -> Result<()> {
        let participant = track.participant.clone();
        if let Some(mut old) = self.by_participant.remove(&participant) {
            if old.track() != &track {
                debug!("[Compensator] {} replaced its track", participant);
            }
            old.detach(engine)?;
        }
        let mut comp = StreamAlignmentCompensator::new(track, self.config, self.default_volume);
        comp.attach(engine, arrival_ms.unwrap_or(sync_offset_ms), sync_offset_ms)?;
        self.by_participant.insert(participant, comp);
        Ok(())
    }

    pub fn track_ended(&mut self, engine: &mut dyn AudioEngine, track: &TrackHandle) -> Result<()> {
        let matches = self
            .by_participant
            .get(&track.participant)
            .map(|c| c.track() == track)
            .unwrap_or(false);
        if matches {
            self.remove_participant(engine, &track.participant)?;
        }
        Ok(())
    }

    pub fn remove_participant(&mut self, engine: &mut dyn AudioEngine, participant: &str) -> Result<()> {
        if let Some(mut comp) = self.by_participant.remove(participant) {
            comp.detach(engine)?;
        }
        Ok(())
    }

    /// Apply a fresh cascade result to every stream.
    pub fn retarget_all(
        &mut self,
        engine: &mut dyn AudioEngine,
        arrivals: &HashMap<ParticipantId, f64>,
        sync_offset_ms: f64,
    ) {
        for (participant, comp) in self.by_participant.iter_mut() {
            let arrival = arrivals.get(participant).copied().unwrap_or(sync_offset_ms);
            if let Err(e) = comp.retarget(engine, arrival, sync_offset_ms) {
                warn!("[Compensator] Retarget for {} failed: {}", participant, e);
            }
        }
    }

    /// Returns false when the participant has no stream.
    pub fn set_volume(&mut self, engine: &mut dyn AudioEngine, participant: &str, volume: u8) -> Result<bool> {
        match self.by_participant.get_mut(participant) {
            Some(comp) => {
                comp.set_volume(engine, volume)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns false when the participant has no stream.
    pub fn set_muted(&mut self, engine: &mut dyn AudioEngine, participant: &str, muted: bool) -> Result<bool> {
        match self.by_participant.get_mut(participant) {
            Some(comp) => {
                comp.set_muted(engine, muted)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Detach every graph, continuing past individual failures.
    pub fn detach_all(&mut self, engine: &mut dyn AudioEngine) {
        for (participant, mut comp) in self.by_participant.drain() {
            if let Err(e) = comp.detach(engine) {
                warn!("[Compensator] Detach for {} failed: {}", participant, e);
            }
        }
    }
}

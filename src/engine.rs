//! Headless audio engine.
//!
//! Keeps an audio clock on a monotonic `Instant`, holds scheduled clicks until
//! they are due and evaluates each stream graph's smoothed delay and gain.
//! Used by the client binary where no output device is driven.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use crate::smoothing::SmoothedParam;
use crate::traits::{AudioEngine, EngineState, GraphId, TrackHandle};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingClick {
    pub at: f64,
    pub accent: bool,
}

struct StreamGraph {
    track: TrackHandle,
    delay: SmoothedParam,
    gain: SmoothedParam,
}

pub struct MonotonicEngine {
    origin: Instant,
    state: EngineState,
    click_sample: Option<PathBuf>,
    click_ready: bool,
    clicks: VecDeque<PendingClick>,
    graphs: HashMap<GraphId, StreamGraph>,
    next_graph: GraphId,
    played: u64,
    refused: u64,
}

impl Default for MonotonicEngine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MonotonicEngine {
    /// Starts suspended. With no sample path a synthesized click is used.
    pub fn new(click_sample: Option<PathBuf>) -> Self {
        MonotonicEngine {
            origin: Instant::now(),
            state: EngineState::Suspended,
            click_sample,
            click_ready: false,
            clicks: VecDeque::new(),
            graphs: HashMap::new(),
            next_graph: 1,
            played: 0,
            refused: 0,
        }
    }

    pub fn played(&self) -> u64 {
        self.played
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn pending_clicks(&self) -> usize {
        self.clicks.len()
    }

    /// Current (delay_s, gain) of a graph.
    #[cfg(test)]
    fn graph_params(&self, graph: GraphId) -> Option<(f64, f64)> {
        let now = self.current_time();
        self.graphs
            .get(&graph)
            .map(|g| (g.delay.value_at(now), g.gain.value_at(now)))
    }

    /// Pop every click whose time has come.
    pub fn render(&mut self) -> Vec<PendingClick> {
        let now = self.current_time();
        let mut due = Vec::new();
        while let Some(click) = self.clicks.front().copied() {
            if click.at > now {
                break;
            }
            self.clicks.pop_front();
            self.played += 1;
            info!(
                "[Audio] {} at {:.3}s (late {:.1}ms)",
                if click.accent { "CLICK" } else { "click" },
                click.at,
                (now - click.at) * 1000.0
            );
            due.push(click);
        }
        due
    }

    /// Drop everything and refuse further work.
    pub fn close(&mut self) {
        if !self.graphs.is_empty() {
            debug!("[Audio] Closing with {} live graph(s)", self.graphs.len());
        }
        self.clicks.clear();
        self.graphs.clear();
        self.state = EngineState::Closed;
    }

    fn graph_mut(&mut self, graph: GraphId) -> Result<&mut StreamGraph> {
        self.graphs
            .get_mut(&graph)
            .ok_or_else(|| anyhow!("No stream graph {}", graph))
    }
}

impl AudioEngine for MonotonicEngine {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn resume(&mut self) -> Result<()> {
        match self.state {
            EngineState::Closed => Err(anyhow!("Audio engine is closed")),
            EngineState::Running => Ok(()),
            EngineState::Suspended => {
                self.state = EngineState::Running;
                info!("[Audio] Output resumed");
                Ok(())
            }
        }
    }

    fn load_click(&mut self) -> Result<()> {
        if let Some(path) = &self.click_sample {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Reading click sample {}", path.display()))?;
            if bytes.is_empty() {
                return Err(anyhow!("Click sample {} is empty", path.display()));
            }
            debug!("[Audio] Loaded click sample ({} bytes)", bytes.len());
        }
        self.click_ready = true;
        Ok(())
    }

    fn schedule_click(&mut self, at: f64, accent: bool) -> Result<()> {
        if !self.click_ready {
            return Err(anyhow!("Click sample not loaded"));
        }
        let now = self.current_time();
        if self.state != EngineState::Running || at < now {
            self.refused += 1;
            debug!("[Audio] Refused click at {:.3}s (now {:.3}s, {:?})", at, now, self.state);
            return Ok(());
        }
        let pos = self.clicks.iter().position(|c| c.at > at).unwrap_or(self.clicks.len());
        self.clicks.insert(pos, PendingClick { at, accent });
        Ok(())
    }

    fn create_stream_graph(&mut self, track: &TrackHandle) -> Result<GraphId> {
        if self.state == EngineState::Closed {
            return Err(anyhow!("Audio engine is closed"));
        }
        let id = self.next_graph;
        self.next_graph += 1;
        self.graphs.insert(
            id,
            StreamGraph {
                track: track.clone(),
                delay: SmoothedParam::new(0.0),
                gain: SmoothedParam::new(1.0),
            },
        );
        debug!("[Audio] Graph {} for {}/{}", id, track.participant, track.track_id);
        Ok(id)
    }

    fn set_delay(&mut self, graph: GraphId, seconds: f64, time_constant: f64) -> Result<()> {
        let now = self.current_time();
        self.graph_mut(graph)?.delay.set_target(seconds, now, time_constant);
        Ok(())
    }

    fn set_gain(&mut self, graph: GraphId, gain: f64, time_constant: f64) -> Result<()> {
        let now = self.current_time();
        self.graph_mut(graph)?.gain.set_target(gain.clamp(0.0, 1.0), now, time_constant);
        Ok(())
    }

    fn destroy_stream_graph(&mut self, graph: GraphId) -> Result<()> {
        let g = self
            .graphs
            .remove(&graph)
            .ok_or_else(|| anyhow!("No stream graph {}", graph))?;
        debug!("[Audio] Graph {} for {} destroyed", graph, g.track.participant);
        Ok(())
    }

    fn live_graphs(&self) -> usize {
        self.graphs.len()
    }
}

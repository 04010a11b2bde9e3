use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::metronome::Role;

/// Diagnostic snapshot of a client session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub participant_id: Option<String>,
    pub role: Role,
    pub clock_offset_ms: f64,
    pub clock_samples: u64,
    pub rtt_ms: Option<f64>,
    pub one_way_ms: Option<f64>,
    pub sync_offset_ms: f64,
    pub playing: bool,
    pub tempo: u16,
    pub beats_per_measure: u8,
    pub beat_count: Option<u64>,
    pub metronome_enabled: bool,
    pub compensators: usize,
    pub updated_ts: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus {
            participant_id: None,
            role: Role::Unassigned,
            clock_offset_ms: 0.0,
            clock_samples: 0,
            rtt_ms: None,
            one_way_ms: None,
            sync_offset_ms: 0.0,
            playing: false,
            tempo: 120,
            beats_per_measure: 4,
            beat_count: None,
            metronome_enabled: true,
            compensators: 0,
            updated_ts: 0,
        }
    }
}

impl SessionStatus {
    /// Write as JSON, replacing the file atomically.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, json).with_context(|| format!("Writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("Replacing {}", path.display()))?;
        Ok(())
    }
}

//! Replicated metronome state and the room reducer that owns leadership.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::protocol::{MetronomeUpdate, ParticipantId};

pub const MIN_TEMPO: u16 = 30;
pub const MAX_TEMPO: u16 = 300;
pub const MAX_BEATS_PER_MEASURE: u8 = 16;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetronomeState {
    pub is_playing: bool,
    pub tempo: u16,
    pub beats_per_measure: u8,
    /// Server epoch-ms at which beat 0 sounded.
    pub start_time: f64,
    pub leader_id: Option<ParticipantId>,
}

impl Default for MetronomeState {
    fn default() -> Self {
        MetronomeState {
            is_playing: false,
            tempo: 120,
            beats_per_measure: 4,
            start_time: 0.0,
            leader_id: None,
        }
    }
}

impl MetronomeState {
    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.tempo as f64
    }

    /// Apply a leader's partial update. `server_now` becomes the start time
    /// when playback begins.
    pub fn apply_update(&mut self, update: &MetronomeUpdate, server_now: f64) -> Result<(), SyncError> {
        if let Some(tempo) = update.tempo {
            validate_tempo(tempo)?;
        }
        if let Some(beats) = update.beats_per_measure {
            validate_meter(beats)?;
        }
        if let Some(tempo) = update.tempo {
            self.tempo = tempo;
        }
        if let Some(beats) = update.beats_per_measure {
            self.beats_per_measure = beats;
        }
        match update.is_playing {
            Some(true) if !self.is_playing => {
                self.is_playing = true;
                self.start_time = server_now;
            }
            Some(false) => self.is_playing = false,
            _ => {}
        }
        Ok(())
    }
}

pub fn validate_tempo(tempo: u16) -> Result<(), SyncError> {
    if (MIN_TEMPO..=MAX_TEMPO).contains(&tempo) {
        Ok(())
    } else {
        Err(SyncError::InvalidTempo(tempo))
    }
}

pub fn validate_meter(beats: u8) -> Result<(), SyncError> {
    if (1..=MAX_BEATS_PER_MEASURE).contains(&beats) {
        Ok(())
    } else {
        Err(SyncError::InvalidMeter(beats))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Leader,
    Follower,
}

/// Leader-only metronome commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetronomeCommand {
    Start,
    Stop,
    ChangeTempo(u16),
    ChangeMeter(u8),
}

impl MetronomeCommand {
    pub fn to_update(self) -> MetronomeUpdate {
        let mut update = MetronomeUpdate::default();
        match self {
            MetronomeCommand::Start => update.is_playing = Some(true),
            MetronomeCommand::Stop => update.is_playing = Some(false),
            MetronomeCommand::ChangeTempo(t) => update.tempo = Some(t),
            MetronomeCommand::ChangeMeter(b) => update.beats_per_measure = Some(b),
        }
        update
    }
}

/// What changed when new authoritative state was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started { start_time: f64 },
    /// Still running but the beat grid moved to a new start time.
    Restarted { start_time: f64 },
    Stopped,
    TempoChanged { from: u16, to: u16 },
    MeterChanged { beats_per_measure: u8 },
    LeaderChanged { leader: Option<ParticipantId>, role: Role },
}

/// Sole writer of the metronome state, the leader id and this client's role.
pub struct RoomState {
    self_id: Option<ParticipantId>,
    state: MetronomeState,
    role: Role,
    awaiting_snapshot: bool,
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomState {
    pub fn new() -> Self {
        RoomState {
            self_id: None,
            state: MetronomeState::default(),
            role: Role::Unassigned,
            awaiting_snapshot: false,
        }
    }

    pub fn state(&self) -> &MetronomeState {
        &self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// True once leadership changed and no fresh snapshot has arrived yet.
    pub fn awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    fn role_for(&self, leader: Option<&str>) -> Role {
        match (self.self_id.as_deref(), leader) {
            (_, None) | (None, _) => Role::Unassigned,
            (Some(me), Some(l)) if me == l => Role::Leader,
            _ => Role::Follower,
        }
    }

    pub fn joined(
        &mut self,
        participant_id: ParticipantId,
        leader_id: Option<ParticipantId>,
        metronome: MetronomeState,
    ) -> Vec<Transition> {
        info!("[Room] Joined as {} (leader {:?})", participant_id, leader_id);
        self.self_id = Some(participant_id);
        let mut out = self.set_leader(leader_id);
        out.extend(self.replace(metronome, true));
        out
    }

    /// Check a command locally before it goes to the server. Nothing is
    /// applied here; the state only changes when the server acknowledges.
    pub fn authorize(&self, command: MetronomeCommand) -> Result<MetronomeUpdate, SyncError> {
        if self.role != Role::Leader {
            return Err(SyncError::LeaderAuthorization(
                "only the metronome leader can change the metronome".to_string(),
            ));
        }
        match command {
            MetronomeCommand::ChangeTempo(t) => validate_tempo(t)?,
            MetronomeCommand::ChangeMeter(b) => validate_meter(b)?,
            _ => {}
        }
        Ok(command.to_update())
    }

    /// Server acknowledged a metronome update, or sent state alongside an offset push.
    pub fn apply_state(&mut self, state: MetronomeState) -> Vec<Transition> {
        self.replace(state, false)
    }

    /// A full `metronomeSync` snapshot. Also serves as the fresh subscription
    /// required after a leadership change.
    pub fn apply_snapshot(
        &mut self,
        is_playing: bool,
        tempo: u16,
        beats_per_measure: u8,
        start_time: f64,
    ) -> Vec<Transition> {
        let next = MetronomeState {
            is_playing,
            tempo,
            beats_per_measure,
            start_time,
            leader_id: self.state.leader_id.clone(),
        };
        self.replace(next, true)
    }

    /// Leadership moved. Local playback is invalidated until a new snapshot
    /// arrives; tempo and start time are kept as last known.
    pub fn leader_changed(&mut self, new_leader: Option<ParticipantId>) -> Vec<Transition> {
        self.awaiting_snapshot = true;
        self.set_leader(new_leader)
    }

    fn set_leader(&mut self, leader: Option<ParticipantId>) -> Vec<Transition> {
        let role = self.role_for(leader.as_deref());
        self.role = role;
        self.state.leader_id = leader.clone();
        info!("[Room] Leader is now {:?}, role {:?}", leader, role);
        vec![Transition::LeaderChanged { leader, role }]
    }

    fn replace(&mut self, mut next: MetronomeState, resubscribe: bool) -> Vec<Transition> {
        if let Err(e) = validate_tempo(next.tempo).and_then(|_| validate_meter(next.beats_per_measure)) {
            warn!("[Room] Dropping metronome state from server: {}", e);
            return Vec::new();
        }
        next.leader_id = self.state.leader_id.clone();
        let old = std::mem::replace(&mut self.state, next);
        let new = &self.state;

        if self.awaiting_snapshot {
            if !resubscribe {
                return Vec::new();
            }
            self.awaiting_snapshot = false;
            return if new.is_playing {
                vec![Transition::Started { start_time: new.start_time }]
            } else {
                Vec::new()
            };
        }

        let mut out = Vec::new();
        match (old.is_playing, new.is_playing) {
            (false, true) => out.push(Transition::Started { start_time: new.start_time }),
            (true, false) => out.push(Transition::Stopped),
            (true, true) if old.start_time != new.start_time => {
                out.push(Transition::Restarted { start_time: new.start_time })
            }
            (true, true) if old.tempo != new.tempo => out.push(Transition::TempoChanged {
                from: old.tempo,
                to: new.tempo,
            }),
            _ => {}
        }
        if old.beats_per_measure != new.beats_per_measure {
            out.push(Transition::MeterChanged {
                beats_per_measure: new.beats_per_measure,
            });
        }
        out
    }
}

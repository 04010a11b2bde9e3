//! Signaling messages and their stream framing.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON body.
//! Clients send [`ClientMessage`]; the server answers with
//! [`ServerMessage::Reply`] (same `id`) or pushes [`ServerMessage::Push`].

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;

use crate::metronome::MetronomeState;

pub type ParticipantId = String;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub id: u64,
    pub body: Request,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    JoinRoom { room_id: String },
    SyncTime { t0: f64 },
    PingServer { ping_id: u64, t0: f64 },
    RecordServerLatency { rtt: f64 },
    UpdateMetronome(MetronomeUpdate),
    AnnounceBeat { beat_number: u64, timestamp: f64 },
}

impl Request {
    /// Requests the server never answers.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Request::RecordServerLatency { .. } | Request::AnnounceBeat { .. }
        )
    }
}

/// Partial metronome change issued by the leader.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetronomeUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beats_per_measure: Option<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerMessage {
    Reply { id: u64, body: Reply },
    Push { event: Push },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Reply {
    Joined {
        participant_id: ParticipantId,
        leader_id: Option<ParticipantId>,
        metronome: MetronomeState,
    },
    TimeSync { t1: f64 },
    Pong { ping_id: u64 },
    Metronome { state: MetronomeState },
    Rejected { reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Push {
    SyncOffsetUpdate {
        sync_offset: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metronome: Option<MetronomeState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_arrivals: Option<HashMap<ParticipantId, f64>>,
    },
    MetronomeSync {
        is_playing: bool,
        tempo: u16,
        beats_per_measure: u8,
        start_time: f64,
        sync_offset: f64,
    },
    BeatSync {
        beat_number: u64,
        leader_timestamp: f64,
        sync_offset: f64,
    },
    LeaderChanged { new_leader_id: Option<ParticipantId> },
    ParticipantLeft { participant_id: ParticipantId },
}

/// Serialize `msg` into one length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(anyhow!("Frame of {} bytes exceeds limit", body.len()));
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.write_u32::<BigEndian>(body.len() as u32)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reassembles frames from a byte stream that may arrive in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder { buf: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame. `Ok(None)` means more bytes are needed.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = Cursor::new(&self.buf[..LEN_PREFIX]).read_u32::<BigEndian>()? as usize;
        if len > MAX_FRAME_LEN {
            return Err(anyhow!("Incoming frame of {} bytes exceeds limit", len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..LEN_PREFIX + len).skip(LEN_PREFIX).collect();
        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

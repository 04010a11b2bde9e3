//! In-process room server: answers clock and latency probes, runs the
//! latency cascade, owns each room's metronome and elects leaders.
//!
//! Every handler returns the messages to deliver; transport is the caller's
//! business.

use log::{debug, info, warn};
use std::collections::HashMap;

use crate::clock::LocalClock;
use crate::metronome::MetronomeState;
use crate::protocol::{ClientMessage, MetronomeUpdate, ParticipantId, Push, Reply, Request, ServerMessage};

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ParticipantId,
    pub msg: ServerMessage,
}

impl Outbound {
    fn reply(to: &str, id: u64, body: Reply) -> Self {
        Outbound {
            to: to.to_string(),
            msg: ServerMessage::Reply { id, body },
        }
    }

    fn push(to: &str, event: Push) -> Self {
        Outbound {
            to: to.to_string(),
            msg: ServerMessage::Push { event },
        }
    }
}

struct Member {
    id: ParticipantId,
    one_way_ms: Option<f64>,
    sync_offset_ms: f64,
}

#[derive(Default)]
struct Room {
    // Join order; the head is next in line for leadership.
    members: Vec<Member>,
    metronome: MetronomeState,
}

impl Room {
    fn member_mut(&mut self, id: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    fn sync_offset(&self, id: &str) -> f64 {
        self.members
            .iter()
            .find(|m| m.id == id)
            .map_or(0.0, |m| m.sync_offset_ms)
    }

    fn is_leader(&self, id: &str) -> bool {
        self.metronome.leader_id.as_deref() == Some(id)
    }

    fn snapshot_for(&self, id: &str) -> Push {
        Push::MetronomeSync {
            is_playing: self.metronome.is_playing,
            tempo: self.metronome.tempo,
            beats_per_measure: self.metronome.beats_per_measure,
            start_time: self.metronome.start_time,
            sync_offset: self.sync_offset(id),
        }
    }

    /// Equalize arrival: everyone plays as late as the slowest link.
    ///
    /// Arrivals are raw path latencies (sender uplink plus receiver
    /// downlink), so a listener's compensation delay
    /// `sync_offset - arrival` is positive only for a path shorter than the
    /// listener's own offset. That happens between two fast members held back by a
    /// slower one; every other stream already lands behind the local grid and
    /// is played undelayed.
    fn cascade(&mut self) -> Vec<Outbound> {
        let Some(max_one_way) = self
            .members
            .iter()
            .filter_map(|m| m.one_way_ms)
            .reduce(f64::max)
        else {
            return Vec::new();
        };

        for m in self.members.iter_mut() {
            if let Some(one_way) = m.one_way_ms {
                m.sync_offset_ms = max_one_way - one_way;
            }
        }

        let mut out = Vec::new();
        for m in self.members.iter() {
            let Some(own) = m.one_way_ms else { continue };
            let arrivals: HashMap<ParticipantId, f64> = self
                .members
                .iter()
                .filter(|p| p.id != m.id)
                .filter_map(|p| p.one_way_ms.map(|ow| (p.id.clone(), ow + own)))
                .collect();
            out.push(Outbound::push(
                &m.id,
                Push::SyncOffsetUpdate {
                    sync_offset: m.sync_offset_ms,
                    metronome: Some(self.metronome.clone()),
                    stream_arrivals: Some(arrivals),
                },
            ));
        }
        out
    }
}

pub struct RoomAuthority<C: LocalClock> {
    clock: C,
    rooms: HashMap<String, Room>,
    membership: HashMap<ParticipantId, String>,
}

impl<C: LocalClock> RoomAuthority<C> {
    pub fn new(clock: C) -> Self {
        RoomAuthority {
            clock,
            rooms: HashMap::new(),
            membership: HashMap::new(),
        }
    }

    /// Identity for a new connection.
    pub fn connect(&mut self) -> ParticipantId {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn room_of(&self, participant: &str) -> Option<&str> {
        self.membership.get(participant).map(String::as_str)
    }

    pub fn leader_of(&self, room_id: &str) -> Option<&str> {
        self.rooms.get(room_id)?.metronome.leader_id.as_deref()
    }

    pub fn metronome(&self, room_id: &str) -> Option<&MetronomeState> {
        self.rooms.get(room_id).map(|r| &r.metronome)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn handle(&mut self, from: &str, message: ClientMessage) -> Vec<Outbound> {
        let id = message.id;
        match message.body {
            Request::JoinRoom { room_id } => self.join(from, id, room_id),
            Request::SyncTime { .. } => vec![Outbound::reply(from, id, Reply::TimeSync { t1: self.clock.now_ms() })],
            Request::PingServer { ping_id, .. } => vec![Outbound::reply(from, id, Reply::Pong { ping_id })],
            Request::RecordServerLatency { rtt } => self.record_latency(from, rtt),
            Request::UpdateMetronome(update) => self.update_metronome(from, id, update),
            Request::AnnounceBeat { beat_number, timestamp } => self.relay_beat(from, beat_number, timestamp),
        }
    }

    fn join(&mut self, from: &str, id: u64, room_id: String) -> Vec<Outbound> {
        if let Some(current) = self.membership.get(from) {
            let reason = format!("already in room {}", current);
            return vec![Outbound::reply(from, id, Reply::Rejected { reason })];
        }

        let room = self.rooms.entry(room_id.clone()).or_default();
        room.members.push(Member {
            id: from.to_string(),
            one_way_ms: None,
            sync_offset_ms: 0.0,
        });
        if room.metronome.leader_id.is_none() {
            room.metronome.leader_id = Some(from.to_string());
        }
        info!(
            "[Authority] {} joined {} ({} present, leader {:?})",
            from,
            room_id,
            room.members.len(),
            room.metronome.leader_id
        );

        let reply = Reply::Joined {
            participant_id: from.to_string(),
            leader_id: room.metronome.leader_id.clone(),
            metronome: room.metronome.clone(),
        };
        self.membership.insert(from.to_string(), room_id);
        vec![Outbound::reply(from, id, reply)]
    }

    fn record_latency(&mut self, from: &str, rtt: f64) -> Vec<Outbound> {
        let Some(room) = self.room_for(from) else {
            debug!("[Authority] Latency from {} outside any room", from);
            return Vec::new();
        };
        if let Some(member) = room.member_mut(from) {
            member.one_way_ms = Some(rtt.max(0.0) / 2.0);
        }
        room.cascade()
    }

    fn update_metronome(&mut self, from: &str, id: u64, update: MetronomeUpdate) -> Vec<Outbound> {
        let now = self.clock.now_ms();
        let Some(room) = self.room_for(from) else {
            let reason = "not in a room".to_string();
            return vec![Outbound::reply(from, id, Reply::Rejected { reason })];
        };
        if !room.is_leader(from) {
            warn!("[Authority] Metronome update from non-leader {}", from);
            let reason = "only the metronome leader can change the metronome".to_string();
            return vec![Outbound::reply(from, id, Reply::Rejected { reason })];
        }
        if let Err(e) = room.metronome.apply_update(&update, now) {
            return vec![Outbound::reply(from, id, Reply::Rejected { reason: e.to_string() })];
        }

        info!(
            "[Authority] Metronome {} @ {} BPM, {} beats/measure",
            if room.metronome.is_playing { "playing" } else { "stopped" },
            room.metronome.tempo,
            room.metronome.beats_per_measure
        );

        let mut out = vec![Outbound::reply(
            from,
            id,
            Reply::Metronome {
                state: room.metronome.clone(),
            },
        )];
        for m in room.members.iter().filter(|m| m.id != from) {
            out.push(Outbound::push(&m.id, room.snapshot_for(&m.id)));
        }
        out
    }

    fn relay_beat(&mut self, from: &str, beat_number: u64, timestamp: f64) -> Vec<Outbound> {
        let Some(room) = self.room_for(from) else {
            return Vec::new();
        };
        if !room.is_leader(from) {
            debug!("[Authority] Ignoring beat from non-leader {}", from);
            return Vec::new();
        }
        room.members
            .iter()
            .filter(|m| m.id != from)
            .map(|m| {
                Outbound::push(
                    &m.id,
                    Push::BeatSync {
                        beat_number,
                        leader_timestamp: timestamp,
                        sync_offset: m.sync_offset_ms,
                    },
                )
            })
            .collect()
    }

    /// Remove a participant. A departing leader is replaced by the earliest
    /// remaining member, who together with everyone else gets the new leader
    /// and a fresh snapshot.
    pub fn disconnect(&mut self, participant: &str) -> Vec<Outbound> {
        let Some(room_id) = self.membership.remove(participant) else {
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };
        room.members.retain(|m| m.id != participant);
        info!("[Authority] {} left {} ({} remain)", participant, room_id, room.members.len());

        if room.members.is_empty() {
            self.rooms.remove(&room_id);
            info!("[Authority] Room {} closed", room_id);
            return Vec::new();
        }

        let mut out: Vec<Outbound> = room
            .members
            .iter()
            .map(|m| {
                Outbound::push(
                    &m.id,
                    Push::ParticipantLeft {
                        participant_id: participant.to_string(),
                    },
                )
            })
            .collect();

        if room.is_leader(participant) {
            let new_leader = room.members.first().map(|m| m.id.clone());
            room.metronome.leader_id = new_leader.clone();
            info!("[Authority] {} now leads {}", new_leader.as_deref().unwrap_or("nobody"), room_id);
            for m in room.members.iter() {
                out.push(Outbound::push(
                    &m.id,
                    Push::LeaderChanged {
                        new_leader_id: new_leader.clone(),
                    },
                ));
                out.push(Outbound::push(&m.id, room.snapshot_for(&m.id)));
            }
        }

        out.extend(room.cascade());
        out
    }

    fn room_for(&mut self, participant: &str) -> Option<&mut Room> {
        let room_id = self.membership.get(participant)?;
        self.rooms.get_mut(room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockLocalClock;
    use crate::compensator::{required_delay_seconds, MAX_DELAY_S};

    fn authority(now_ms: f64) -> RoomAuthority<MockLocalClock> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockLocalClock::new();
        clock.expect_now_ms().returning(move || now_ms);
        RoomAuthority::new(clock)
    }

    fn msg(id: u64, body: Request) -> ClientMessage {
        ClientMessage { id, body }
    }

    fn join(auth: &mut RoomAuthority<MockLocalClock>, room: &str) -> ParticipantId {
        let p = auth.connect();
        auth.handle(&p, msg(1, Request::JoinRoom { room_id: room.into() }));
        p
    }

    fn pushes_to<'a>(out: &'a [Outbound], to: &str) -> Vec<&'a Push> {
        out.iter()
            .filter(|o| o.to == to)
            .filter_map(|o| match &o.msg {
                ServerMessage::Push { event } => Some(event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_first_joiner_leads() {
        let mut auth = authority(1_000.0);
        let a = auth.connect();
        let b = auth.connect();
        assert_ne!(a, b);

        let out = auth.handle(&a, msg(1, Request::JoinRoom { room_id: "jam".into() }));
        assert_eq!(
            out,
            vec![Outbound::reply(
                &a,
                1,
                Reply::Joined {
                    participant_id: a.clone(),
                    leader_id: Some(a.clone()),
                    metronome: MetronomeState {
                        leader_id: Some(a.clone()),
                        ..Default::default()
                    },
                }
            )]
        );

        let out = auth.handle(&b, msg(1, Request::JoinRoom { room_id: "jam".into() }));
        match &out[0].msg {
            ServerMessage::Reply {
                body: Reply::Joined { leader_id, .. },
                ..
            } => assert_eq!(leader_id.as_deref(), Some(a.as_str())),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(auth.room_of(&b), Some("jam"));

        let again = auth.handle(&b, msg(2, Request::JoinRoom { room_id: "other".into() }));
        assert!(matches!(
            again[0].msg,
            ServerMessage::Reply {
                body: Reply::Rejected { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_probes_answered() {
        let mut auth = authority(5_000.0);
        let p = auth.connect();
        assert_eq!(
            auth.handle(&p, msg(3, Request::SyncTime { t0: 1.0 })),
            vec![Outbound::reply(&p, 3, Reply::TimeSync { t1: 5_000.0 })]
        );
        assert_eq!(
            auth.handle(&p, msg(4, Request::PingServer { ping_id: 9, t0: 1.0 })),
            vec![Outbound::reply(&p, 4, Reply::Pong { ping_id: 9 })]
        );
    }

    #[test]
    fn test_cascade_aligns_to_slowest_link() {
        let mut auth = authority(1_000.0);
        let a = join(&mut auth, "jam");
        let b = join(&mut auth, "jam");

        let out = auth.handle(&a, msg(2, Request::RecordServerLatency { rtt: 100.0 }));
        assert_eq!(out.len(), 1);
        assert!(pushes_to(&out, &b).is_empty());

        let out = auth.handle(&b, msg(2, Request::RecordServerLatency { rtt: 20.0 }));
        let expect = |to: &str, offset: f64, other: &str| {
            let pushes = pushes_to(&out, to);
            match pushes.as_slice() {
                [Push::SyncOffsetUpdate {
                    sync_offset,
                    stream_arrivals: Some(arrivals),
                    ..
                }] => {
                    assert_eq!(*sync_offset, offset);
                    assert_eq!(arrivals.get(other), Some(&60.0));
                }
                other => panic!("unexpected {:?}", other),
            }
        };
        expect(&a, 0.0, &b);
        expect(&b, 40.0, &a);
    }

    #[test]
    fn test_cascade_delays_only_fast_pairs() {
        let mut auth = authority(1_000.0);
        let a = join(&mut auth, "jam");
        let b = join(&mut auth, "jam");
        let slow = join(&mut auth, "jam");
        auth.handle(&a, msg(2, Request::RecordServerLatency { rtt: 20.0 }));
        auth.handle(&b, msg(2, Request::RecordServerLatency { rtt: 20.0 }));
        let out = auth.handle(&slow, msg(2, Request::RecordServerLatency { rtt: 200.0 }));

        let delay_at_a = |from: &str| match pushes_to(&out, &a).as_slice() {
            [Push::SyncOffsetUpdate {
                sync_offset,
                stream_arrivals: Some(arrivals),
                ..
            }] => required_delay_seconds(*sync_offset, arrivals[from], MAX_DELAY_S),
            other => panic!("unexpected {:?}", other),
        };
        // a waits 90ms for the slow link; b's 20ms path is 70ms early.
        assert!((delay_at_a(&b) - 0.070).abs() < 1e-9);
        assert_eq!(delay_at_a(&slow), 0.0);
    }

    #[test]
    fn test_only_leader_changes_metronome() {
        let mut auth = authority(42_000.0);
        let a = join(&mut auth, "jam");
        let b = join(&mut auth, "jam");

        let start = Request::UpdateMetronome(MetronomeUpdate {
            is_playing: Some(true),
            ..Default::default()
        });
        let out = auth.handle(&b, msg(5, start.clone()));
        assert!(matches!(
            out[0].msg,
            ServerMessage::Reply {
                id: 5,
                body: Reply::Rejected { .. }
            }
        ));
        assert!(!auth.metronome("jam").unwrap().is_playing);

        let out = auth.handle(&a, msg(6, start));
        let state = auth.metronome("jam").unwrap().clone();
        assert!(state.is_playing);
        assert_eq!(state.start_time, 42_000.0);
        assert_eq!(out[0], Outbound::reply(&a, 6, Reply::Metronome { state }));
        assert_eq!(
            pushes_to(&out, &b),
            vec![&Push::MetronomeSync {
                is_playing: true,
                tempo: 120,
                beats_per_measure: 4,
                start_time: 42_000.0,
                sync_offset: 0.0,
            }]
        );

        let bad = Request::UpdateMetronome(MetronomeUpdate {
            tempo: Some(500),
            ..Default::default()
        });
        let out = auth.handle(&a, msg(7, bad));
        assert_eq!(out.len(), 1);
        assert_eq!(auth.metronome("jam").unwrap().tempo, 120);
    }

    #[test]
    fn test_beats_relayed_from_leader_only() {
        let mut auth = authority(1_000.0);
        let a = join(&mut auth, "jam");
        let b = join(&mut auth, "jam");
        let c = join(&mut auth, "jam");

        let out = auth.handle(&a, msg(8, Request::AnnounceBeat { beat_number: 4, timestamp: 3_000.0 }));
        assert_eq!(out.len(), 2);
        assert!(pushes_to(&out, &a).is_empty());
        assert_eq!(
            pushes_to(&out, &c),
            vec![&Push::BeatSync {
                beat_number: 4,
                leader_timestamp: 3_000.0,
                sync_offset: 0.0,
            }]
        );
        assert!(auth
            .handle(&b, msg(9, Request::AnnounceBeat { beat_number: 4, timestamp: 3_000.0 }))
            .is_empty());
    }

    #[test]
    fn test_leader_leave_elects_earliest_remaining() {
        let mut auth = authority(1_000.0);
        let a = join(&mut auth, "jam");
        let b = join(&mut auth, "jam");
        let c = join(&mut auth, "jam");

        let out = auth.disconnect(&a);
        assert_eq!(auth.leader_of("jam"), Some(b.as_str()));
        for p in [&b, &c] {
            let pushes = pushes_to(&out, p);
            assert_eq!(pushes[0], &Push::ParticipantLeft { participant_id: a.clone() });
            assert_eq!(pushes[1], &Push::LeaderChanged { new_leader_id: Some(b.clone()) });
            assert!(matches!(pushes[2], Push::MetronomeSync { .. }));
        }

        // A follower leaving does not move leadership.
        let out = auth.disconnect(&c);
        assert_eq!(auth.leader_of("jam"), Some(b.as_str()));
        assert_eq!(pushes_to(&out, &b).len(), 1);

        assert!(auth.disconnect(&b).is_empty());
        assert_eq!(auth.room_count(), 0);
        assert!(auth.disconnect(&b).is_empty());
    }
}

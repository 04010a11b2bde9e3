use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::clock::LocalClock;
use crate::compensator::CompensatorSet;
use crate::config::SessionConfig;
use crate::error::SyncError;
use crate::estimator::ClockSyncEstimator;
use crate::latency::LatencyMonitor;
use crate::metronome::{MetronomeCommand, MetronomeState, Role, RoomState, Transition};
use crate::protocol::{ClientMessage, Push, Reply, Request, ServerMessage};
use crate::scheduler::{BeatScheduler, GridAnchor, ScheduledBeat};
use crate::status::SessionStatus;
use crate::traits::{AudioEngine, MediaEvent, MediaTransport, SignalingChannel};

// Replies that never arrive are forgotten after this long.
const OUTSTANDING_TTL_MS: f64 = 30_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Join,
    SyncTime,
    Ping,
    Metronome,
}

struct Outstanding {
    kind: RequestKind,
    sent_ms: f64,
}

/// Drives one client session: owns every component and feeds them from the
/// signaling channel, the media layer and the scheduler timer, all on the
/// caller's loop.
pub struct SessionController<S, A, M, C>
where
    S: SignalingChannel,
    A: AudioEngine,
    M: MediaTransport,
    C: LocalClock,
{
    signaling: S,
    audio: A,
    media: M,
    clock: C,
    config: SessionConfig,
    room_id: String,

    estimator: ClockSyncEstimator,
    latency: LatencyMonitor,
    room: RoomState,
    scheduler: BeatScheduler,
    compensators: CompensatorSet,

    next_request_id: u64,
    outstanding: HashMap<u64, Outstanding>,
    last_clock_sync_ms: Option<f64>,
    last_latency_probe_ms: Option<f64>,
    metronome_enabled: bool,
    last_rejection: Option<SyncError>,
    last_leader_beat: Option<(u64, f64)>,
    closed: bool,
}

impl<S, A, M, C> SessionController<S, A, M, C>
where
    S: SignalingChannel,
    A: AudioEngine,
    M: MediaTransport,
    C: LocalClock,
{
    pub fn new(signaling: S, mut audio: A, media: M, clock: C, config: SessionConfig, room_id: &str) -> Self {
        let metronome_enabled = match audio.load_click() {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "[Session] {}. Metronome playback disabled.",
                    SyncError::AudioEngineUnavailable(e.to_string())
                );
                false
            }
        };

        SessionController {
            estimator: ClockSyncEstimator::new(config.clock_sync.timeout_ms as f64, config.clock_sync.smoothing),
            latency: LatencyMonitor::new(config.latency.timeout_ms as f64),
            room: RoomState::new(),
            scheduler: BeatScheduler::new(config.scheduler_config()),
            compensators: CompensatorSet::new(config.compensator_config(), config.compensator.default_volume),
            signaling,
            audio,
            media,
            clock,
            config,
            room_id: room_id.to_string(),
            next_request_id: 1,
            outstanding: HashMap::new(),
            last_clock_sync_ms: None,
            last_latency_probe_ms: None,
            metronome_enabled,
            last_rejection: None,
            last_leader_beat: None,
            closed: false,
        }
    }

    pub fn room(&self) -> &RoomState {
        &self.room
    }

    pub fn scheduler(&self) -> &BeatScheduler {
        &self.scheduler
    }

    pub fn estimator(&self) -> &ClockSyncEstimator {
        &self.estimator
    }

    pub fn latency(&self) -> &LatencyMonitor {
        &self.latency
    }

    pub fn compensators(&self) -> &CompensatorSet {
        &self.compensators
    }

    pub fn audio(&self) -> &A {
        &self.audio
    }

    pub fn audio_mut(&mut self) -> &mut A {
        &mut self.audio
    }

    pub fn metronome_enabled(&self) -> bool {
        self.metronome_enabled
    }

    pub fn last_rejection(&self) -> Option<&SyncError> {
        self.last_rejection.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn send_request(&mut self, body: Request, kind: Option<RequestKind>) -> Result<u64> {
        let id = self.next_request_id;
        self.next_request_id += 1;
        if let Some(kind) = kind {
            self.outstanding.insert(
                id,
                Outstanding {
                    kind,
                    sent_ms: self.clock.now_ms(),
                },
            );
        }
        self.signaling.send(ClientMessage { id, body })?;
        Ok(id)
    }

    pub fn join(&mut self) -> Result<()> {
        info!("[Session] Joining room {}", self.room_id);
        let room_id = self.room_id.clone();
        self.send_request(Request::JoinRoom { room_id }, Some(RequestKind::Join))?;
        Ok(())
    }

    /// Ask the server to change the metronome. Followers are refused here
    /// without sending; nothing is applied until the server answers.
    pub fn command(&mut self, command: MetronomeCommand) -> Result<u64> {
        let update = self.room.authorize(command)?;
        info!("[Session] Requesting {:?}", command);
        self.send_request(Request::UpdateMetronome(update), Some(RequestKind::Metronome))
    }

    /// Resume audio output. Call only from a user action.
    pub fn user_resume_audio(&mut self) -> Result<()> {
        self.audio.resume()
    }

    pub fn set_volume(&mut self, participant: &str, volume: u8) -> Result<bool> {
        self.compensators.set_volume(&mut self.audio, participant, volume)
    }

    /// Silence a participant's stream without tearing its graph down.
    pub fn set_muted(&mut self, participant: &str, muted: bool) -> Result<bool> {
        self.compensators.set_muted(&mut self.audio, participant, muted)
    }

    pub fn process_loop_iteration(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        while let Some(msg) = self.signaling.try_recv()? {
            self.handle_server_message(msg)?;
        }

        let now = self.clock.now_ms();
        self.run_periodic(now)?;

        while let Some(event) = self.media.poll_event() {
            self.handle_media_event(event);
        }

        self.poll_scheduler()?;
        Ok(())
    }

    fn run_periodic(&mut self, now: f64) -> Result<()> {
        self.estimator.check_timeout(now);
        self.latency.check_timeout(now);
        self.outstanding.retain(|id, o| {
            let keep = now - o.sent_ms < OUTSTANDING_TTL_MS;
            if !keep {
                debug!("[Session] Giving up on {:?} request {}", o.kind, id);
            }
            keep
        });

        let clock_due = self
            .last_clock_sync_ms
            .map_or(true, |t| now - t >= self.config.clock_sync.interval_ms as f64);
        if clock_due {
            self.last_clock_sync_ms = Some(now);
            let id = self.next_request_id;
            let body = self.estimator.begin(id, now);
            self.send_request(body, Some(RequestKind::SyncTime))?;
        }

        let latency_due = self
            .last_latency_probe_ms
            .map_or(true, |t| now - t >= self.config.latency.interval_ms as f64);
        if latency_due {
            self.last_latency_probe_ms = Some(now);
            let body = self.latency.measure(now);
            self.send_request(body, Some(RequestKind::Ping))?;
        }
        Ok(())
    }

    fn handle_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Reply { id, body } => self.handle_reply(id, body),
            ServerMessage::Push { event } => self.handle_push(event),
        }
    }

    fn handle_reply(&mut self, id: u64, body: Reply) -> Result<()> {
        let kind = self.outstanding.remove(&id).map(|o| o.kind);
        let now = self.clock.now_ms();

        match body {
            Reply::Joined {
                participant_id,
                leader_id,
                metronome,
            } => {
                let transitions = self.room.joined(participant_id, leader_id, metronome);
                self.apply_transitions(transitions);
            }
            Reply::TimeSync { t1 } => {
                let previous = self.estimator.offset_ms();
                let first_sample = self.estimator.samples() == 0;
                match self.estimator.on_reply(id, t1, now) {
                    Ok(offset) => self.clock_offset_changed(offset - previous, first_sample),
                    Err(e) => debug!("[Session] {}", e),
                }
            }
            Reply::Pong { ping_id } => match self.latency.on_ack(ping_id, now) {
                Ok(report) => {
                    self.send_request(report, None)?;
                }
                Err(e) => debug!("[Session] {}", e),
            },
            Reply::Metronome { state } => {
                let transitions = self.room.apply_state(state);
                self.apply_transitions(transitions);
            }
            Reply::Rejected { reason } => {
                let err = match kind {
                    Some(RequestKind::Metronome) => SyncError::LeaderAuthorization(reason),
                    _ => {
                        warn!("[Session] Request {} ({:?}) rejected: {}", id, kind, reason);
                        return Ok(());
                    }
                };
                warn!("[Session] {}", err);
                self.last_rejection = Some(err);
            }
        }
        Ok(())
    }

    fn handle_push(&mut self, event: Push) -> Result<()> {
        match event {
            Push::SyncOffsetUpdate {
                sync_offset,
                metronome,
                stream_arrivals,
            } => {
                self.apply_sync_offset(sync_offset);
                if let Some(arrivals) = stream_arrivals {
                    self.latency.set_stream_arrivals(arrivals);
                }
                self.compensators.retarget_all(
                    &mut self.audio,
                    self.latency.stream_arrivals(),
                    self.latency.sync_offset_ms(),
                );
                if let Some(state) = metronome {
                    let transitions = self.room.apply_state(state);
                    self.apply_transitions(transitions);
                }
            }
            Push::MetronomeSync {
                is_playing,
                tempo,
                beats_per_measure,
                start_time,
                sync_offset,
            } => {
                self.apply_sync_offset(sync_offset);
                let transitions = self.room.apply_snapshot(is_playing, tempo, beats_per_measure, start_time);
                self.apply_transitions(transitions);
            }
            Push::BeatSync {
                beat_number,
                leader_timestamp,
                sync_offset: _,
            } => {
                self.check_leader_beat(beat_number, leader_timestamp);
            }
            Push::LeaderChanged { new_leader_id } => {
                let transitions = self.room.leader_changed(new_leader_id);
                self.apply_transitions(transitions);
            }
            Push::ParticipantLeft { participant_id } => {
                info!("[Session] Participant {} left", participant_id);
                self.compensators.remove_participant(&mut self.audio, &participant_id)?;
                self.latency.forget(&participant_id);
            }
        }
        Ok(())
    }

    /// Keep a running grid on the server clock as the offset estimate moves.
    /// A room that was already playing starts once the first sample lands.
    fn clock_offset_changed(&mut self, delta_ms: f64, first_sample: bool) {
        if self.scheduler.is_running() {
            if delta_ms != 0.0 {
                self.scheduler.shift_clock_offset(delta_ms);
            }
        } else if first_sample && self.room.state().is_playing {
            self.start_scheduler();
        }
    }

    fn apply_sync_offset(&mut self, sync_offset: f64) {
        let delta = self.latency.apply_sync_offset(sync_offset);
        if delta != 0.0 {
            self.scheduler.shift_sync_offset(delta);
        }
    }

    /// Compare a leader's beat echo with where the grid says that beat is.
    fn check_leader_beat(&mut self, beat_number: u64, leader_timestamp: f64) {
        self.last_leader_beat = Some((beat_number, leader_timestamp));
        let state = self.room.state();
        if !state.is_playing {
            return;
        }
        let expected = state.start_time + beat_number as f64 * state.seconds_per_beat() * 1000.0;
        debug!(
            "[Session] Leader beat #{} deviates {:+.1}ms from grid",
            beat_number,
            leader_timestamp - expected
        );
    }

    fn apply_transitions(&mut self, transitions: Vec<Transition>) {
        for t in transitions {
            match t {
                Transition::Started { .. } | Transition::Restarted { .. } => self.start_scheduler(),
                Transition::Stopped => {
                    self.scheduler.stop();
                }
                Transition::TempoChanged { from, to } => {
                    info!("[Session] Tempo {} -> {} BPM", from, to);
                    self.scheduler.set_tempo(to);
                }
                Transition::MeterChanged { beats_per_measure } => {
                    self.scheduler.set_beats_per_measure(beats_per_measure);
                }
                Transition::LeaderChanged { leader, role } => {
                    if self.scheduler.stop() {
                        info!("[Session] Leadership moved to {:?}; playback reset", leader);
                    }
                    if role == Role::Leader {
                        info!("[Session] This client now leads the metronome");
                    }
                }
            }
        }
    }

    fn start_scheduler(&mut self) {
        if !self.metronome_enabled {
            debug!("[Session] Metronome disabled, not scheduling");
            return;
        }
        if self.room.awaiting_snapshot() {
            return;
        }
        if self.estimator.samples() == 0 {
            debug!("[Session] Waiting for a clock sample before scheduling");
            return;
        }
        let state: &MetronomeState = self.room.state();
        let anchor = GridAnchor {
            tempo: state.tempo,
            beats_per_measure: state.beats_per_measure,
            start_time_ms: state.start_time,
            clock_offset_ms: self.estimator.offset_ms(),
            sync_offset_ms: self.latency.sync_offset_ms(),
            local_now_ms: self.clock.now_ms(),
            audio_now: self.audio.current_time(),
        };
        self.scheduler.start(anchor);
    }

    fn poll_scheduler(&mut self) -> Result<()> {
        let audio_now = self.audio.current_time();
        let Some(outcome) = self.scheduler.poll(audio_now) else {
            return Ok(());
        };
        for beat in outcome.scheduled {
            if let Err(e) = self.audio.schedule_click(beat.audio_time, beat.accent) {
                warn!("[Session] Click #{} not scheduled: {}", beat.index, e);
            }
            if self.room.is_leader() {
                self.announce(beat, audio_now)?;
            }
        }
        Ok(())
    }

    fn announce(&mut self, beat: ScheduledBeat, audio_now: f64) -> Result<()> {
        let server_now = self.estimator.server_now(self.clock.now_ms());
        let timestamp = server_now + (beat.audio_time - audio_now) * 1000.0;
        self.send_request(
            Request::AnnounceBeat {
                beat_number: beat.index,
                timestamp,
            },
            None,
        )?;
        Ok(())
    }

    fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::TrackAvailable(track) => {
                if Some(track.participant.as_str()) == self.room.self_id() {
                    return;
                }
                let arrival = self.latency.arrival_for(&track.participant);
                let sync_offset = self.latency.sync_offset_ms();
                if let Err(e) = self
                    .compensators
                    .track_available(&mut self.audio, track, arrival, sync_offset)
                {
                    warn!("[Session] Could not attach stream: {}", e);
                }
            }
            MediaEvent::TrackEnded(track) => {
                if let Err(e) = self.compensators.track_ended(&mut self.audio, &track) {
                    warn!("[Session] Could not detach stream: {}", e);
                }
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        let sample = self.latency.latest();
        let state = self.room.state();
        SessionStatus {
            participant_id: self.room.self_id().map(str::to_string),
            role: self.room.role(),
            clock_offset_ms: self.estimator.offset_ms(),
            clock_samples: self.estimator.samples(),
            rtt_ms: sample.map(|s| s.rtt_ms),
            one_way_ms: sample.map(|s| s.one_way_ms),
            sync_offset_ms: self.latency.sync_offset_ms(),
            playing: state.is_playing,
            tempo: state.tempo,
            beats_per_measure: state.beats_per_measure,
            beat_count: self.scheduler.cursor().map(|c| c.beat_count),
            metronome_enabled: self.metronome_enabled,
            compensators: self.compensators.len(),
            updated_ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    pub fn log_status(&self) {
        let s = self.status();
        let rtt = s.rtt_ms.map_or("-".to_string(), |v| format!("{:.1}ms", v));
        if s.playing {
            info!(
                "[Status] {:?} | {} BPM {}/4 | beat {:?} | offset {:+.1}ms | rtt {} | sync {:+.1}ms | streams {}",
                s.role, s.tempo, s.beats_per_measure, s.beat_count, s.clock_offset_ms, rtt, s.sync_offset_ms, s.compensators
            );
        } else {
            info!(
                "[Status] {:?} | stopped | offset {:+.1}ms | rtt {} | sync {:+.1}ms | streams {}",
                s.role, s.clock_offset_ms, rtt, s.sync_offset_ms, s.compensators
            );
        }
        if let Some((beat, ts)) = self.last_leader_beat {
            debug!("[Status] Last leader beat #{} at {:.0}", beat, ts);
        }
    }

    /// Log delivery statistics for every inbound stream.
    pub fn log_track_stats(&self) {
        if self.compensators.is_empty() {
            info!("[Stats] No active audio streams to measure");
            return;
        }
        for track in self.compensators.tracks() {
            match self.media.track_stats(track) {
                Ok(stats) => info!(
                    "[Stats] {} lost {} | jitter buffer {:.3}s | rtt {}",
                    track.participant,
                    stats.packets_lost,
                    stats.jitter_buffer_delay_s,
                    stats.round_trip_ms.map_or("-".to_string(), |v| format!("{:.1}ms", v))
                ),
                Err(e) => warn!("[Stats] {}: {}", track.participant, e),
            }
        }
    }

    /// Release every resource: scheduler timer, stream graphs, capture and
    /// the signaling link. Idempotent.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.scheduler.stop();
        self.compensators.detach_all(&mut self.audio);
        if let Err(e) = self.media.stop_capture() {
            warn!("[Session] Stopping capture failed: {}", e);
        }
        if let Err(e) = self.signaling.close() {
            warn!("[Session] Closing signaling failed: {}", e);
        }
        info!("[Session] Left room {}", self.room_id);
    }
}

impl<S, A, M, C> Drop for SessionController<S, A, M, C>
where
    S: SignalingChannel,
    A: AudioEngine,
    M: MediaTransport,
    C: LocalClock,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockLocalClock;
    use crate::traits::{EngineState, GraphId, MockAudioEngine, MockMediaTransport, MockSignalingChannel, TrackHandle, TrackStats};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const EPS: f64 = 1e-9;

    type TestController = SessionController<MockSignalingChannel, MockAudioEngine, MockMediaTransport, MockLocalClock>;

    /// Shared state behind the mocks so tests can drive and inspect them.
    #[derive(Clone, Default)]
    struct Harness {
        inbox: Arc<Mutex<VecDeque<ServerMessage>>>,
        sent: Arc<Mutex<Vec<ClientMessage>>>,
        media: Arc<Mutex<VecDeque<MediaEvent>>>,
        clicks: Arc<Mutex<Vec<(f64, bool)>>>,
        graphs: Arc<Mutex<Vec<GraphId>>>,
        local_ms: Arc<Mutex<f64>>,
        audio_s: Arc<Mutex<f64>>,
    }

    impl Harness {
        fn at(&self, local_ms: f64, audio_s: f64) {
            *self.local_ms.lock().unwrap() = local_ms;
            *self.audio_s.lock().unwrap() = audio_s;
        }

        fn reply(&self, id: u64, body: Reply) {
            self.inbox.lock().unwrap().push_back(ServerMessage::Reply { id, body });
        }

        fn push(&self, event: Push) {
            self.inbox.lock().unwrap().push_back(ServerMessage::Push { event });
        }

        fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn sent_matching(&self, f: impl Fn(&Request) -> bool) -> Vec<ClientMessage> {
            self.sent().into_iter().filter(|m| f(&m.body)).collect()
        }

        fn live_graphs(&self) -> usize {
            self.graphs.lock().unwrap().len()
        }
    }

    fn controller(h: &Harness, click_ok: bool) -> TestController {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut channel = MockSignalingChannel::new();
        let sent = h.sent.clone();
        channel.expect_send().returning(move |m| {
            sent.lock().unwrap().push(m);
            Ok(())
        });
        let inbox = h.inbox.clone();
        channel
            .expect_try_recv()
            .returning(move || Ok(inbox.lock().unwrap().pop_front()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let mut audio = MockAudioEngine::new();
        if click_ok {
            audio.expect_load_click().times(1).returning(|| Ok(()));
        } else {
            audio
                .expect_load_click()
                .times(1)
                .returning(|| Err(anyhow!("click sample missing")));
        }
        let audio_s = h.audio_s.clone();
        audio
            .expect_current_time()
            .returning(move || *audio_s.lock().unwrap());
        audio.expect_state().returning(|| EngineState::Running);
        let clicks = h.clicks.clone();
        audio.expect_schedule_click().returning(move |at, accent| {
            clicks.lock().unwrap().push((at, accent));
            Ok(())
        });
        let graphs = h.graphs.clone();
        let next = Arc::new(Mutex::new(0u64));
        audio.expect_create_stream_graph().returning(move |_| {
            let mut n = next.lock().unwrap();
            *n += 1;
            graphs.lock().unwrap().push(*n);
            Ok(*n)
        });
        let graphs = h.graphs.clone();
        audio.expect_destroy_stream_graph().returning(move |g| {
            graphs.lock().unwrap().retain(|x| *x != g);
            Ok(())
        });
        audio.expect_set_delay().returning(|_, _, _| Ok(()));
        audio.expect_set_gain().returning(|_, _, _| Ok(()));
        let graphs = h.graphs.clone();
        audio
            .expect_live_graphs()
            .returning(move || graphs.lock().unwrap().len());

        let mut media = MockMediaTransport::new();
        let events = h.media.clone();
        media
            .expect_poll_event()
            .returning(move || events.lock().unwrap().pop_front());
        media.expect_track_stats().returning(|_| {
            Ok(TrackStats {
                packets_lost: 3,
                jitter_buffer_delay_s: 0.04,
                round_trip_ms: Some(55.0),
            })
        });
        media.expect_stop_capture().times(1).returning(|| Ok(()));

        let mut clock = MockLocalClock::new();
        let local_ms = h.local_ms.clone();
        clock
            .expect_now_ms()
            .returning(move || *local_ms.lock().unwrap());

        SessionController::new(channel, audio, media, clock, SessionConfig::default(), "jam")
    }

    fn playing(tempo: u16, start_time: f64) -> MetronomeState {
        MetronomeState {
            is_playing: true,
            tempo,
            start_time,
            ..Default::default()
        }
    }

    fn bob() -> TrackHandle {
        TrackHandle {
            participant: "bob".into(),
            track_id: "mic".into(),
        }
    }

    /// Join as `me` with `leader` leading and the given metronome state.
    fn joined(h: &Harness, c: &mut TestController, me: &str, leader: &str, metronome: MetronomeState) {
        c.join().unwrap();
        h.reply(
            1,
            Reply::Joined {
                participant_id: me.into(),
                leader_id: Some(leader.into()),
                metronome,
            },
        );
        c.process_loop_iteration().unwrap();
        answer_clock_sync(h, c, 0.0);
    }

    /// Answer the latest clock-sync request instantly so the estimate lands
    /// exactly on `offset_ms`.
    fn answer_clock_sync(h: &Harness, c: &mut TestController, offset_ms: f64) {
        let request = h
            .sent_matching(|r| matches!(r, Request::SyncTime { .. }))
            .pop()
            .unwrap();
        let now = *h.local_ms.lock().unwrap();
        h.reply(request.id, Reply::TimeSync { t1: now + offset_ms });
        c.process_loop_iteration().unwrap();
    }

    #[test]
    fn test_late_join_follows_running_grid() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "lead", playing(120, 6_800.0));

        assert_eq!(
            h.sent()[0],
            ClientMessage {
                id: 1,
                body: Request::JoinRoom { room_id: "jam".into() }
            }
        );
        assert_eq!(c.room().role(), Role::Follower);
        let cursor = c.scheduler().cursor().unwrap();
        assert_eq!(cursor.beat_count, 7);
        assert!((cursor.next_beat_audio_time - 5.3).abs() < EPS);
        assert!(h.clicks.lock().unwrap().is_empty());

        h.at(10_250.0, 5.25);
        c.process_loop_iteration().unwrap();
        let clicks = h.clicks.lock().unwrap().clone();
        assert_eq!(clicks.len(), 1);
        assert!((clicks[0].0 - 5.3).abs() < EPS);
        assert!(!clicks[0].1);
        assert!(h.sent_matching(|r| matches!(r, Request::AnnounceBeat { .. })).is_empty());
    }

    #[test]
    fn test_playback_waits_for_first_clock_sample() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        c.join().unwrap();
        h.reply(
            1,
            Reply::Joined {
                participant_id: "me".into(),
                leader_id: Some("lead".into()),
                metronome: playing(120, 11_800.0),
            },
        );
        c.process_loop_iteration().unwrap();
        assert_eq!(c.estimator().samples(), 0);
        assert!(!c.scheduler().is_running());

        // Server runs 5 s ahead: 3.2 s into the grid, so beat 7 is next.
        answer_clock_sync(&h, &mut c, 5_000.0);
        assert_eq!(c.estimator().offset_ms(), 5_000.0);
        let cursor = c.scheduler().cursor().unwrap();
        assert_eq!(cursor.beat_count, 7);
        assert!((cursor.next_beat_audio_time - 5.3).abs() < EPS);
    }

    #[test]
    fn test_clock_resample_moves_running_grid() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "lead", playing(120, 6_800.0));
        assert!(c.scheduler().is_running());

        h.at(20_000.0, 15.0);
        c.process_loop_iteration().unwrap();
        assert_eq!(h.sent_matching(|r| matches!(r, Request::SyncTime { .. })).len(), 2);
        let before = c.scheduler().cursor().unwrap().clone();

        answer_clock_sync(&h, &mut c, 40.0);
        let after = c.scheduler().cursor().unwrap();
        assert_eq!(after.beat_count, before.beat_count);
        assert!((after.next_beat_audio_time - (before.next_beat_audio_time - 0.04)).abs() < EPS);
        assert_eq!(c.scheduler().active_timers(), 1);
    }

    #[test]
    fn test_clock_sync_reply_sets_offset() {
        let h = Harness::default();
        h.at(1_000.0, 0.0);
        let mut c = controller(&h, true);
        c.process_loop_iteration().unwrap();

        let sync = h.sent_matching(|r| matches!(r, Request::SyncTime { .. }));
        assert_eq!(sync.len(), 1);
        assert_eq!(sync[0].body, Request::SyncTime { t0: 1_000.0 });

        h.at(1_100.0, 0.1);
        h.reply(999, Reply::TimeSync { t1: 0.0 });
        h.reply(sync[0].id, Reply::TimeSync { t1: 6_000.0 });
        c.process_loop_iteration().unwrap();

        assert!((c.estimator().offset_ms() - 4_950.0).abs() < EPS);
        assert_eq!(c.estimator().samples(), 1);
        // Not due again until the interval elapses.
        assert_eq!(h.sent_matching(|r| matches!(r, Request::SyncTime { .. })).len(), 1);
    }

    #[test]
    fn test_pong_reported_to_server() {
        let h = Harness::default();
        h.at(1_000.0, 0.0);
        let mut c = controller(&h, true);
        c.process_loop_iteration().unwrap();

        let ping = h.sent_matching(|r| matches!(r, Request::PingServer { .. }));
        assert_eq!(ping[0].body, Request::PingServer { ping_id: 1, t0: 1_000.0 });

        h.at(1_080.0, 0.08);
        h.reply(ping[0].id, Reply::Pong { ping_id: 1 });
        c.process_loop_iteration().unwrap();

        let reports = h.sent_matching(|r| matches!(r, Request::RecordServerLatency { .. }));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].body, Request::RecordServerLatency { rtt: 80.0 });
        assert_eq!(c.status().one_way_ms, Some(40.0));
    }

    #[test]
    fn test_follower_command_refused_locally() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "lead", MetronomeState::default());

        let err = c.command(MetronomeCommand::Start).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::LeaderAuthorization(_))
        ));
        assert!(h.sent_matching(|r| matches!(r, Request::UpdateMetronome(_))).is_empty());
        assert!(!c.scheduler().is_running());
    }

    #[test]
    fn test_leader_start_waits_for_ack_then_announces() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "me", MetronomeState::default());
        assert!(c.room().is_leader());

        let id = c.command(MetronomeCommand::Start).unwrap();
        assert!(!c.scheduler().is_running());
        let updates = h.sent_matching(|r| matches!(r, Request::UpdateMetronome(_)));
        assert_eq!(updates[0].id, id);
        assert_eq!(updates[0].body, Request::UpdateMetronome(MetronomeCommand::Start.to_update()));

        let mut state = playing(120, 10_000.0);
        state.leader_id = Some("me".into());
        h.reply(id, Reply::Metronome { state });
        c.process_loop_iteration().unwrap();

        assert_eq!(h.clicks.lock().unwrap().clone(), vec![(5.0, true)]);
        let announced = h.sent_matching(|r| matches!(r, Request::AnnounceBeat { .. }));
        assert_eq!(
            announced[0].body,
            Request::AnnounceBeat {
                beat_number: 0,
                timestamp: 10_000.0
            }
        );
    }

    #[test]
    fn test_server_rejection_is_surfaced() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "me", MetronomeState::default());

        let id = c.command(MetronomeCommand::ChangeTempo(140)).unwrap();
        h.reply(id, Reply::Rejected { reason: "not the leader".into() });
        c.process_loop_iteration().unwrap();

        assert_eq!(
            c.last_rejection(),
            Some(&SyncError::LeaderAuthorization("not the leader".into()))
        );
        assert_eq!(c.room().state().tempo, 120);
    }

    #[test]
    fn test_sync_offset_push_shifts_running_grid() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "lead", playing(120, 6_800.0));
        let before = c.scheduler().cursor().unwrap().clone();

        h.push(Push::SyncOffsetUpdate {
            sync_offset: 40.0,
            metronome: None,
            stream_arrivals: None,
        });
        c.process_loop_iteration().unwrap();

        let after = c.scheduler().cursor().unwrap();
        assert_eq!(after.beat_count, before.beat_count);
        assert!((after.next_beat_audio_time - before.next_beat_audio_time - 0.04).abs() < EPS);
        assert_eq!(c.latency().sync_offset_ms(), 40.0);
    }

    #[test]
    fn test_leader_change_waits_for_snapshot() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "lead", playing(120, 6_800.0));
        assert!(c.scheduler().is_running());

        h.push(Push::LeaderChanged {
            new_leader_id: Some("me".into()),
        });
        c.process_loop_iteration().unwrap();
        assert!(!c.scheduler().is_running());
        assert_eq!(c.room().role(), Role::Leader);

        // Offset pushes carry state but do not resume playback.
        h.push(Push::SyncOffsetUpdate {
            sync_offset: 10.0,
            metronome: Some(playing(120, 6_800.0)),
            stream_arrivals: None,
        });
        c.process_loop_iteration().unwrap();
        assert!(!c.scheduler().is_running());

        h.push(Push::MetronomeSync {
            is_playing: true,
            tempo: 90,
            beats_per_measure: 3,
            start_time: 9_000.0,
            sync_offset: 10.0,
        });
        c.process_loop_iteration().unwrap();
        assert!(c.scheduler().is_running());
        assert_eq!(c.scheduler().active_timers(), 1);
        assert_eq!(c.room().state().tempo, 90);
    }

    #[test]
    fn test_remote_streams_follow_cascade() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "lead", MetronomeState::default());

        let arrivals = HashMap::from([("bob".to_string(), 70.0)]);
        h.push(Push::SyncOffsetUpdate {
            sync_offset: 120.0,
            metronome: None,
            stream_arrivals: Some(arrivals),
        });
        h.media.lock().unwrap().push_back(MediaEvent::TrackAvailable(bob()));
        h.media.lock().unwrap().push_back(MediaEvent::TrackAvailable(TrackHandle {
            participant: "me".into(),
            track_id: "mic".into(),
        }));
        c.process_loop_iteration().unwrap();

        assert_eq!(h.live_graphs(), 1);
        let graph = c.compensators().get("bob").unwrap().graph().unwrap().clone();
        assert!((graph.delay_s - 0.05).abs() < EPS);
        c.log_track_stats();

        assert!(c.set_volume("bob", 50).unwrap());
        assert!(!c.set_volume("carol", 50).unwrap());
        assert!(c.set_muted("bob", true).unwrap());
        assert_eq!(c.compensators().get("bob").unwrap().graph().unwrap().gain, 0.0);
        assert!(c.set_muted("bob", false).unwrap());
        assert_eq!(c.compensators().get("bob").unwrap().graph().unwrap().gain, 0.5);
        assert!(!c.set_muted("carol", true).unwrap());
        assert_eq!(h.live_graphs(), 1);

        h.push(Push::ParticipantLeft {
            participant_id: "bob".into(),
        });
        c.process_loop_iteration().unwrap();
        assert_eq!(h.live_graphs(), 0);
        assert!(c.compensators().is_empty());
        assert_eq!(c.latency().arrival_for("bob"), None);
    }

    #[test]
    fn test_start_stop_start_then_shutdown_releases_everything() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        joined(&h, &mut c, "me", "me", MetronomeState::default());
        h.media.lock().unwrap().push_back(MediaEvent::TrackAvailable(bob()));

        let mut state = playing(120, 10_000.0);
        h.reply(50, Reply::Metronome { state: state.clone() });
        c.process_loop_iteration().unwrap();
        state.is_playing = false;
        h.reply(51, Reply::Metronome { state: state.clone() });
        c.process_loop_iteration().unwrap();
        assert!(!c.scheduler().is_running());
        state.is_playing = true;
        state.start_time = 11_000.0;
        h.reply(52, Reply::Metronome { state });
        c.process_loop_iteration().unwrap();

        assert_eq!(c.scheduler().active_timers(), 1);
        assert_eq!(h.live_graphs(), 1);

        c.shutdown();
        assert!(c.is_closed());
        assert!(!c.scheduler().is_running());
        assert_eq!(h.live_graphs(), 0);

        // Second shutdown and later iterations are no-ops; the mocks
        // verify close and stop_capture ran exactly once.
        c.shutdown();
        let sent = h.sent().len();
        c.process_loop_iteration().unwrap();
        assert_eq!(h.sent().len(), sent);
    }

    #[test]
    fn test_click_load_failure_disables_metronome_only() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, false);
        joined(&h, &mut c, "me", "lead", playing(120, 6_800.0));

        assert!(!c.metronome_enabled());
        assert!(!c.scheduler().is_running());
        assert!(c.room().state().is_playing);
        assert_eq!(h.sent_matching(|r| matches!(r, Request::SyncTime { .. })).len(), 1);

        h.media.lock().unwrap().push_back(MediaEvent::TrackAvailable(bob()));
        c.process_loop_iteration().unwrap();
        assert_eq!(h.live_graphs(), 1);
        assert!(!c.status().metronome_enabled);
    }

    #[test]
    fn test_audio_resumes_only_on_user_action() {
        let h = Harness::default();
        h.at(10_000.0, 5.0);
        let mut c = controller(&h, true);
        // Any resume from network handling would hit the mock without an
        // expectation and fail.
        joined(&h, &mut c, "me", "lead", playing(120, 6_800.0));
        h.push(Push::MetronomeSync {
            is_playing: true,
            tempo: 120,
            beats_per_measure: 4,
            start_time: 6_800.0,
            sync_offset: 0.0,
        });
        c.process_loop_iteration().unwrap();

        c.audio_mut().expect_resume().times(1).returning(|| Ok(()));
        c.user_resume_audio().unwrap();
    }
}

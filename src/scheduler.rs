//! Lookahead beat scheduler.
//!
//! The scheduler never reads a clock itself. Callers pass the current local
//! wall-clock and audio-clock readings, so the whole thing runs
//! deterministically under test. Its tick timer is a deadline on the audio
//! clock that the owning loop polls.

use log::{debug, info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// How far ahead of the audio clock beats are committed (s).
    pub lookahead_s: f64,
    /// Spacing between ticks (s).
    pub tick_interval_s: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            lookahead_s: 0.100,
            tick_interval_s: 0.025,
        }
    }
}

/// Everything needed to place the authoritative beat grid on the local audio clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridAnchor {
    pub tempo: u16,
    pub beats_per_measure: u8,
    /// Server epoch-ms of beat 0.
    pub start_time_ms: f64,
    pub clock_offset_ms: f64,
    pub sync_offset_ms: f64,
    pub local_now_ms: f64,
    pub audio_now: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBeat {
    pub index: u64,
    pub audio_time: f64,
    pub accent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TickTimer {
    due: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerCursor {
    pub next_beat_audio_time: f64,
    pub beat_count: u64,
    timer: TickTimer,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    pub scheduled: Vec<ScheduledBeat>,
    pub skipped: u64,
}

pub struct BeatScheduler {
    config: SchedulerConfig,
    seconds_per_beat: f64,
    beats_per_measure: u8,
    cursor: Option<SchedulerCursor>,
}

impl BeatScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        BeatScheduler {
            config,
            seconds_per_beat: 0.5,
            beats_per_measure: 4,
            cursor: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn cursor(&self) -> Option<&SchedulerCursor> {
        self.cursor.as_ref()
    }

    pub fn seconds_per_beat(&self) -> f64 {
        self.seconds_per_beat
    }

    /// Number of armed tick timers. Never more than one.
    pub fn active_timers(&self) -> usize {
        usize::from(self.cursor.is_some())
    }

    /// Place the cursor on the grid and arm the tick timer for immediate
    /// firing. A running cursor is discarded first. Returns the index of the
    /// first beat that will be scheduled.
    pub fn start(&mut self, anchor: GridAnchor) -> u64 {
        if self.cursor.take().is_some() {
            debug!("[Scheduler] Restart discards running cursor");
        }
        self.seconds_per_beat = 60.0 / anchor.tempo as f64;
        self.beats_per_measure = anchor.beats_per_measure.max(1);

        let server_now = anchor.local_now_ms + anchor.clock_offset_ms;
        let time_until_start = (anchor.start_time_ms - server_now) / 1000.0;
        let mut first = anchor.audio_now + time_until_start + anchor.sync_offset_ms / 1000.0;

        let beat_count = if first < anchor.audio_now {
            let elapsed = anchor.audio_now - first;
            let skip = (elapsed / self.seconds_per_beat).ceil();
            first += skip * self.seconds_per_beat;
            skip as u64
        } else {
            0
        };

        info!(
            "[Scheduler] Start @ {} BPM, first beat #{} at {:.3}s (now {:.3}s)",
            anchor.tempo, beat_count, first, anchor.audio_now
        );

        self.cursor = Some(SchedulerCursor {
            next_beat_audio_time: first,
            beat_count,
            timer: TickTimer { due: anchor.audio_now },
        });
        beat_count
    }

    /// Cancel the tick timer and drop the cursor.
    pub fn stop(&mut self) -> bool {
        let was_running = self.cursor.take().is_some();
        if was_running {
            info!("[Scheduler] Stopped");
        }
        was_running
    }

    /// Affects beats not yet scheduled; the cursor is left in place.
    pub fn set_tempo(&mut self, tempo: u16) {
        self.seconds_per_beat = 60.0 / tempo as f64;
        debug!("[Scheduler] Tempo {} BPM ({:.4}s/beat)", tempo, self.seconds_per_beat);
    }

    pub fn set_beats_per_measure(&mut self, beats: u8) {
        self.beats_per_measure = beats.max(1);
    }

    /// Nudge the cursor by a sync offset change without restarting it.
    pub fn shift_sync_offset(&mut self, delta_ms: f64) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.next_beat_audio_time += delta_ms / 1000.0;
            debug!(
                "[Scheduler] Sync offset shift {:+.1}ms, next beat at {:.4}s",
                delta_ms, cursor.next_beat_audio_time
            );
        }
    }

    /// A larger clock offset means the server is further ahead, so every
    /// pending beat moves earlier on the audio clock.
    pub fn shift_clock_offset(&mut self, delta_ms: f64) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.next_beat_audio_time -= delta_ms / 1000.0;
            debug!(
                "[Scheduler] Clock offset shift {:+.1}ms, next beat at {:.4}s",
                delta_ms, cursor.next_beat_audio_time
            );
        }
    }

    /// Run a tick if the timer is due.
    pub fn poll(&mut self, audio_now: f64) -> Option<TickOutcome> {
        let due = self.cursor.as_ref()?.timer.due;
        if audio_now < due {
            return None;
        }
        self.tick(audio_now)
    }

    /// Commit every beat inside the lookahead window and re-arm the timer.
    /// Beats already behind `audio_now` are skipped rather than bursted.
    pub fn tick(&mut self, audio_now: f64) -> Option<TickOutcome> {
        let spb = self.seconds_per_beat;
        let beats_per_measure = self.beats_per_measure as u64;
        let horizon = audio_now + self.config.lookahead_s;
        let cursor = self.cursor.as_mut()?;

        let mut outcome = TickOutcome::default();
        while cursor.next_beat_audio_time < horizon {
            if cursor.next_beat_audio_time < audio_now {
                outcome.skipped += 1;
            } else {
                outcome.scheduled.push(ScheduledBeat {
                    index: cursor.beat_count,
                    audio_time: cursor.next_beat_audio_time,
                    accent: cursor.beat_count % beats_per_measure == 0,
                });
            }
            cursor.beat_count += 1;
            cursor.next_beat_audio_time += spb;
        }
        cursor.timer.due = audio_now + self.config.tick_interval_s;

        if outcome.skipped > 0 {
            warn!("[Scheduler] {}", SyncError::SchedulerUnderrun { missed: outcome.skipped });
        }
        Some(outcome)
    }
}

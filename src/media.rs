use anyhow::{anyhow, Result};
use log::info;

use crate::traits::{MediaEvent, MediaTransport, TrackHandle, TrackStats};

/// Media layer for a session with no audio transport attached: no remote
/// tracks ever appear and there is nothing to capture.
#[derive(Debug, Default)]
pub struct DetachedMedia {
    stopped: bool,
}

impl MediaTransport for DetachedMedia {
    fn poll_event(&mut self) -> Option<MediaEvent> {
        None
    }

    fn track_stats(&self, track: &TrackHandle) -> Result<TrackStats> {
        Err(anyhow!("No media transport for {}", track.participant))
    }

    fn stop_capture(&mut self) -> Result<()> {
        if !self.stopped {
            self.stopped = true;
            info!("[Media] Capture stopped");
        }
        Ok(())
    }
}

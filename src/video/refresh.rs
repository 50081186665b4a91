use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    media::{
        events::RefreshTimer,
        sync::{ClockSource, NOSYNC_THRESHOLD, SYNC_THRESHOLD, SyncState},
    },
    video::{display::PictureSink, picture::PictureQueue},
};

/// Assumed frame delay until the stream tells us better (25 fps).
pub const DEFAULT_FRAME_DELAY: f64 = 0.040;
/// Floor for the scheduled wait between refreshes.
const MIN_ACTUAL_DELAY: f64 = 0.010;

/// Frame pacing state. Shared between the refresh step (control thread) and
/// the seek reset (demuxer thread), hence the mutex around it.
pub struct VideoTiming {
    /// Wall time at which the next frame is due.
    pub frame_timer: f64,
    pub frame_last_delay: f64,
    pub frame_last_pts: f64,
}

impl VideoTiming {
    pub fn new(now: f64) -> Self {
        Self {
            frame_timer: now,
            frame_last_delay: DEFAULT_FRAME_DELAY,
            frame_last_pts: 0.0,
        }
    }

    /// Discards pacing history across a discontinuity (seek, resume).
    pub fn reset(&mut self, now: f64) {
        self.frame_timer = now;
        self.frame_last_delay = DEFAULT_FRAME_DELAY;
        self.frame_last_pts = 0.0;
    }
}

/// Computes how long to wait before the next refresh once `pts` goes on
/// screen, compressing or stretching the nominal inter-frame delay so video
/// tracks the reference clock. `ref_clock` is `None` when video is its own
/// master and the cadence is left untouched.
pub fn next_frame_delay(
    timing: &mut VideoTiming,
    pts: f64,
    ref_clock: Option<f64>,
    now: f64,
) -> f64 {
    let mut delay = pts - timing.frame_last_pts;
    if delay < 0.0 || delay >= 1.0 {
        // nonsense step across a discontinuity, reuse the previous delay
        delay = timing.frame_last_delay;
    }
    timing.frame_last_delay = delay;
    timing.frame_last_pts = pts;

    if let Some(ref_clock) = ref_clock {
        let diff = pts - ref_clock;
        let sync_threshold = delay.max(SYNC_THRESHOLD);
        if diff.abs() < NOSYNC_THRESHOLD {
            if diff <= -sync_threshold {
                // behind the master: show immediately and catch up
                delay = 0.0;
            } else if diff >= sync_threshold {
                // ahead of the master: hold this frame longer
                delay *= 2.0;
            }
        }
    }

    timing.frame_timer += delay;
    let actual_delay = timing.frame_timer - now;
    actual_delay.max(MIN_ACTUAL_DELAY)
}

/// Runs the per-tick video presentation step: pull the next picture, pace it
/// against the reference clock, rearm the timer, hand the pixels to the
/// sink.
pub struct RefreshDriver {
    sync: Arc<SyncState>,
    pictures: Arc<PictureQueue>,
    timing: Arc<Mutex<VideoTiming>>,
    master: Option<Arc<dyn ClockSource>>,
    timer: RefreshTimer,
    sink: Box<dyn PictureSink>,
    has_video: bool,
}

impl RefreshDriver {
    pub fn new(
        sync: Arc<SyncState>,
        pictures: Arc<PictureQueue>,
        timing: Arc<Mutex<VideoTiming>>,
        master: Option<Arc<dyn ClockSource>>,
        timer: RefreshTimer,
        sink: Box<dyn PictureSink>,
        has_video: bool,
    ) -> Self {
        Self {
            sync,
            pictures,
            timing,
            master,
            timer,
            sink,
            has_video,
        }
    }

    /// Kicks off the tick cadence; the first frame shows after one nominal
    /// frame delay.
    pub fn start(&self) {
        self.timer.schedule(40);
    }

    pub fn on_refresh(&mut self) {
        if !self.has_video {
            self.timer.schedule(100);
            return;
        }
        let Some(picture) = self.pictures.take() else {
            // decoder has not delivered yet, re-check shortly
            self.timer.schedule(1);
            return;
        };

        self.sync.mark_video_frame(picture.pts);
        let now = self.sync.wall_seconds();
        let ref_clock = self.master.as_ref().map(|clock| clock.now());
        let actual_delay = {
            let mut timing = self.timing.lock();
            next_frame_delay(&mut timing, picture.pts, ref_clock, now)
        };
        self.timer.schedule((actual_delay * 1000.0 + 0.5) as u64);
        self.sink.display(picture);
    }

    pub fn stop(&mut self) {
        self.timer.shutdown();
    }
}

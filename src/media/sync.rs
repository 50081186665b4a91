use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tracing::debug;

use crate::media::clock::{AtomicF64, WallClock};

/// Drift below which the video scheduler perturbs per-frame delay.
pub const SYNC_THRESHOLD: f64 = 0.01;
/// Drift beyond which synchronisation is abandoned for one step and treated
/// as a discontinuity.
pub const NOSYNC_THRESHOLD: f64 = 10.0;

const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;
const AUDIO_DIFF_AVG_NB: u32 = 20;

/// Which clock the other streams chase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    AudioMaster,
    VideoMaster,
    ExternalMaster,
}

/// The shared clock state. One instance, owned by the player state; every
/// field is an atomic word so the audio device callback and the refresh
/// scheduler can read clocks without touching pipeline locks.
pub struct SyncState {
    mode: SyncMode,
    wall: WallClock,
    /// PTS at the end of the most recently decoded audio chunk.
    audio_clock: AtomicF64,
    /// Audio bytes decoded but not yet played by the device callback.
    audio_pending: AtomicUsize,
    /// `sample_rate * channels * 2` for S16 output; 0 without audio.
    audio_bytes_per_sec: f64,
    /// PTS predicted for the next decoded video frame.
    next_video_pts: AtomicF64,
    /// PTS of the picture currently on screen, and the wall time at which it
    /// went up. `video_pts` is NaN until the first picture after a reset.
    video_pts: AtomicF64,
    video_pts_time: AtomicF64,
    /// Offset applied to wall time so the external clock re-anchors on seek.
    external_offset: AtomicF64,
}

impl SyncState {
    pub fn new(mode: SyncMode, audio_rate: u32, audio_channels: u16) -> Self {
        Self {
            mode,
            wall: WallClock::new(),
            audio_clock: AtomicF64::new(0.0),
            audio_pending: AtomicUsize::new(0),
            audio_bytes_per_sec: f64::from(audio_rate) * f64::from(audio_channels) * 2.0,
            next_video_pts: AtomicF64::new(0.0),
            video_pts: AtomicF64::new(f64::NAN),
            video_pts_time: AtomicF64::new(0.0),
            external_offset: AtomicF64::new(0.0),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn wall_seconds(&self) -> f64 {
        self.wall.seconds()
    }

    pub fn external_clock(&self) -> f64 {
        self.wall.seconds() + self.external_offset.load()
    }

    /// The audio position actually heard: the clock word minus the time the
    /// still-buffered bytes will take to play.
    pub fn audio_clock(&self) -> f64 {
        let pts = self.audio_clock.load();
        if self.audio_bytes_per_sec == 0.0 {
            return pts;
        }
        let pending = self.audio_pending.load(Ordering::Acquire) as f64;
        pts - pending / self.audio_bytes_per_sec
    }

    pub fn video_clock(&self) -> f64 {
        let pts = self.video_pts.load();
        if pts.is_nan() {
            // nothing displayed since the last reset, fall back to the
            // decoder's running estimate
            return self.next_video_pts.load();
        }
        pts + (self.wall.seconds() - self.video_pts_time.load())
    }

    pub fn master_clock(&self) -> f64 {
        match self.mode {
            SyncMode::AudioMaster => self.audio_clock(),
            SyncMode::VideoMaster => self.video_clock(),
            SyncMode::ExternalMaster => self.external_clock(),
        }
    }

    /// Re-anchors every clock estimate at `target` seconds. Called when a
    /// seek request is filed, before the demuxer executes it.
    pub fn reset_clock(&self, target: f64) {
        // pending bytes stay accounted: the pre-seek samples still in the
        // output ring are subtracted when the device callback drops them
        self.audio_clock.store(target);
        self.next_video_pts.store(target);
        self.external_offset.store(target - self.wall.seconds());
        debug!(target, "clocks re-anchored");
    }

    pub fn set_audio_clock(&self, pts: f64) {
        self.audio_clock.store(pts);
    }

    pub fn advance_audio_clock(&self, bytes: usize) {
        if self.audio_bytes_per_sec > 0.0 {
            self.audio_clock.add(bytes as f64 / self.audio_bytes_per_sec);
        }
    }

    pub fn audio_bytes_per_sec(&self) -> f64 {
        self.audio_bytes_per_sec
    }

    /// Fill side: account bytes handed to the output ring (before they are
    /// published, so the derived clock never runs ahead).
    pub fn add_pending_audio(&self, bytes: usize) {
        self.audio_pending.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Device side: account bytes actually played.
    pub fn take_played_audio(&self, bytes: usize) {
        let prev = self.audio_pending.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes);
    }

    pub fn next_video_pts(&self) -> f64 {
        self.next_video_pts.load()
    }

    pub fn set_next_video_pts(&self, pts: f64) {
        self.next_video_pts.store(pts);
    }

    pub fn advance_next_video_pts(&self, delta: f64) {
        self.next_video_pts.add(delta);
    }

    /// Records that a picture just went on screen.
    pub fn mark_video_frame(&self, pts: f64) {
        self.video_pts.store(pts);
        self.video_pts_time.store(self.wall.seconds());
    }

    /// Part of the seek reset: the displayed position is unknown until the
    /// first post-seek picture.
    pub fn reset_video_position(&self) {
        self.video_pts.store(f64::NAN);
        self.video_pts_time.store(self.wall.seconds());
    }
}

/// The reference clock the video scheduler chases. Wired once at init so the
/// video side never reaches into audio state directly.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> f64;
}

pub struct AudioClock(pub Arc<SyncState>);

impl ClockSource for AudioClock {
    fn now(&self) -> f64 {
        self.0.audio_clock()
    }
}

pub struct ExternalClock(pub Arc<SyncState>);

impl ClockSource for ExternalClock {
    fn now(&self) -> f64 {
        self.0.external_clock()
    }
}

/// Returns the reference clock for the configured mode, or `None` when video
/// is its own master and delays should stay unperturbed.
pub fn master_source(sync: &Arc<SyncState>) -> Option<Arc<dyn ClockSource>> {
    match sync.mode() {
        SyncMode::AudioMaster => Some(Arc::new(AudioClock(sync.clone())) as Arc<dyn ClockSource>),
        SyncMode::ExternalMaster => {
            Some(Arc::new(ExternalClock(sync.clone())) as Arc<dyn ClockSource>)
        }
        SyncMode::VideoMaster => None,
    }
}

/// Settles the presentation timestamp of a decoded video frame and advances
/// the running video clock by one frame duration. A zero `pts` means the
/// container gave us nothing usable and the running clock stands in.
pub fn synchronize_video(sync: &SyncState, pts: f64, time_base: f64, repeat: f64) -> f64 {
    let pts = if pts != 0.0 {
        sync.set_next_video_pts(pts);
        pts
    } else {
        sync.next_video_pts()
    };

    let mut frame_delay = time_base;
    frame_delay += repeat * (frame_delay * 0.5);
    sync.advance_next_video_pts(frame_delay);
    pts
}

/// Nudges audio chunk sizes so the audio clock converges on the master when
/// audio is not the master itself. The measured drift feeds an exponential
/// average; once warmed up, chunks are stretched or shrunk by at most
/// `SAMPLE_CORRECTION_PERCENT_MAX` percent.
pub struct DriftCorrector {
    diff_cum: f64,
    diff_avg_coef: f64,
    diff_threshold: f64,
    avg_count: u32,
    sample_rate: f64,
    frame_samples: usize,
}

impl DriftCorrector {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            diff_cum: 0.0,
            // weight such that the oldest of AUDIO_DIFF_AVG_NB samples
            // contributes one percent
            diff_avg_coef: 0.01f64.powf(1.0 / f64::from(AUDIO_DIFF_AVG_NB)),
            // two device buffers of slack before correcting
            diff_threshold: 2.0 * 1024.0 / f64::from(sample_rate),
            avg_count: 0,
            sample_rate: f64::from(sample_rate),
            frame_samples: usize::from(channels),
        }
    }

    pub fn reset(&mut self) {
        self.diff_cum = 0.0;
        self.avg_count = 0;
    }

    /// Resizes `samples` (S16 interleaved) toward the master clock. `diff`
    /// is `audio_clock - master_clock` in seconds. Shrinking truncates;
    /// growing replicates the final sample frame.
    pub fn apply(&mut self, samples: &mut Vec<i16>, diff: f64) {
        if samples.is_empty() {
            return;
        }
        if diff.abs() >= NOSYNC_THRESHOLD {
            // discontinuity, the average would only poison future chunks
            self.reset();
            return;
        }

        self.diff_cum = diff + self.diff_avg_coef * self.diff_cum;
        if self.avg_count < AUDIO_DIFF_AVG_NB {
            self.avg_count += 1;
            return;
        }

        let avg_diff = self.diff_cum * (1.0 - self.diff_avg_coef);
        if avg_diff.abs() < self.diff_threshold {
            return;
        }

        // positive drift means audio ran ahead in media time; padding the
        // chunk stretches it over more wall time so the master catches up,
        // negative drift truncates and lets audio skip forward
        let frame_bytes = self.frame_samples * 2;
        let samples_size = samples.len() * 2;
        let wanted_size =
            samples_size as i64 + (diff * self.sample_rate) as i64 * frame_bytes as i64;
        let min_size = (samples_size * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let max_size = (samples_size * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let wanted_size = wanted_size.clamp(min_size, max_size) as usize;

        // whole sample frames only
        let wanted_len = wanted_size / 2 / self.frame_samples * self.frame_samples;
        if wanted_len < samples.len() {
            samples.truncate(wanted_len);
        } else if wanted_len > samples.len() {
            let tail: Vec<i16> = samples[samples.len() - self.frame_samples..].to_vec();
            while samples.len() < wanted_len {
                samples.extend_from_slice(&tail);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_sync() -> SyncState {
        SyncState::new(SyncMode::AudioMaster, 48_000, 2)
    }

    #[test]
    fn audio_clock_subtracts_pending_bytes() {
        let sync = audio_sync();
        sync.set_audio_clock(2.0);
        // one second of S16 stereo at 48 kHz
        sync.add_pending_audio(48_000 * 2 * 2);
        assert!((sync.audio_clock() - 1.0).abs() < 1e-9);
        sync.take_played_audio(48_000 * 2);
        assert!((sync.audio_clock() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn advance_audio_clock_uses_byte_rate() {
        let sync = audio_sync();
        sync.set_audio_clock(0.0);
        sync.advance_audio_clock(48_000 * 2 * 2);
        assert!((sync.audio_clock.load() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn video_clock_falls_back_until_first_picture() {
        let sync = audio_sync();
        sync.set_next_video_pts(7.5);
        assert_eq!(sync.video_clock(), 7.5);

        sync.mark_video_frame(3.0);
        let clock = sync.video_clock();
        assert!(clock >= 3.0 && clock < 3.5);
    }

    #[test]
    fn reset_clock_anchors_all_estimates() {
        let sync = SyncState::new(SyncMode::ExternalMaster, 44_100, 2);
        sync.reset_clock(12.0);
        assert!((sync.audio_clock() - 12.0).abs() < 1e-9);
        assert!((sync.external_clock() - 12.0).abs() < 0.05);
        assert!((sync.master_clock() - 12.0).abs() < 0.05);
    }

    #[test]
    fn reset_clock_keeps_in_flight_bytes_accounted() {
        let sync = SyncState::new(SyncMode::AudioMaster, 48_000, 2);
        sync.add_pending_audio(48_000);
        sync.reset_clock(10.0);
        // quarter second of stereo S16 still queued from before the seek
        assert!((sync.audio_clock() - 9.75).abs() < 1e-9);
        sync.take_played_audio(48_000);
        assert!((sync.audio_clock() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn synchronize_video_adopts_authoritative_pts() {
        let sync = audio_sync();
        let tb = 1.0 / 30.0;
        let pts = synchronize_video(&sync, 1.0, tb, 0.0);
        assert_eq!(pts, 1.0);
        assert!((sync.next_video_pts() - (1.0 + tb)).abs() < 1e-9);
    }

    #[test]
    fn synchronize_video_substitutes_running_clock_for_zero_pts() {
        let sync = audio_sync();
        let tb = 1.0 / 25.0;
        synchronize_video(&sync, 2.0, tb, 0.0);
        let pts = synchronize_video(&sync, 0.0, tb, 0.0);
        assert!((pts - (2.0 + tb)).abs() < 1e-9);
    }

    #[test]
    fn synchronize_video_counts_repeated_fields() {
        let sync = audio_sync();
        let tb = 0.04;
        synchronize_video(&sync, 1.0, tb, 1.0);
        assert!((sync.next_video_pts() - (1.0 + tb * 1.5)).abs() < 1e-9);
    }

    fn warmed_corrector(rate: u32, channels: u16) -> DriftCorrector {
        let mut corrector = DriftCorrector::new(rate, channels);
        // drive the average past the warm-up window with a steady drift
        let mut warmup = vec![0i16; usize::from(channels) * 16];
        for _ in 0..AUDIO_DIFF_AVG_NB {
            corrector.apply(&mut warmup, 0.5);
        }
        corrector
    }

    #[test]
    fn corrector_is_inert_during_warmup() {
        let mut corrector = DriftCorrector::new(48_000, 2);
        let mut samples = vec![1i16; 2_000];
        for _ in 0..AUDIO_DIFF_AVG_NB {
            corrector.apply(&mut samples, 0.5);
            assert_eq!(samples.len(), 2_000);
        }
    }

    #[test]
    fn corrector_truncates_when_audio_lags() {
        let mut corrector = warmed_corrector(48_000, 2);
        let mut samples = vec![1i16; 2_000];
        corrector.apply(&mut samples, -0.5);
        // clamped at minus ten percent, frame aligned
        assert_eq!(samples.len(), 1_800);
    }

    #[test]
    fn corrector_extends_by_replicating_last_frame_when_audio_is_ahead() {
        let mut corrector = warmed_corrector(48_000, 2);
        let mut samples: Vec<i16> = (0..2_000).map(|v| v as i16).collect();
        let last_frame = samples[samples.len() - 2..].to_vec();
        corrector.apply(&mut samples, 0.5);
        // clamped at plus ten percent
        assert_eq!(samples.len(), 2_200);
        assert_eq!(&samples[2_198..], &last_frame[..]);
        assert_eq!(&samples[1_998..2_000], &last_frame[..]);
    }

    #[test]
    fn corrector_keeps_whole_sample_frames() {
        let mut corrector = warmed_corrector(48_000, 6);
        let mut samples = vec![0i16; 6 * 100];
        corrector.apply(&mut samples, -0.5);
        assert_eq!(samples.len() % 6, 0);
    }

    #[test]
    fn corrector_resets_on_discontinuity() {
        let mut corrector = warmed_corrector(48_000, 2);
        let mut samples = vec![0i16; 2_000];
        corrector.apply(&mut samples, NOSYNC_THRESHOLD + 1.0);
        assert_eq!(samples.len(), 2_000);
        // back inside the window the warm-up starts over
        corrector.apply(&mut samples, 0.5);
        assert_eq!(samples.len(), 2_000);
    }

    #[test]
    fn corrector_leaves_small_drift_alone() {
        let mut corrector = warmed_corrector(48_000, 2);
        // settle the running average back near zero
        let mut samples = vec![0i16; 2_000];
        for _ in 0..200 {
            samples.resize(2_000, 0);
            corrector.apply(&mut samples, 0.0);
        }
        samples.resize(2_000, 0);
        corrector.apply(&mut samples, 0.001);
        assert_eq!(samples.len(), 2_000);
    }
}

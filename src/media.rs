pub mod clock;
pub mod demux;
pub mod events;
pub mod queue;
pub mod sync;

use std::{
    sync::{Arc, atomic::AtomicBool, atomic::Ordering},
    thread,
};

use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::{
    audio::{self, output::AudioOutput},
    error::{PlayerError, Result},
    media::{
        events::{PlayerEvent, RefreshTimer},
        queue::PacketQueue,
        sync::{SyncMode, SyncState, master_source},
    },
    video::{
        self,
        display::PictureSink,
        picture::PictureQueue,
        refresh::{RefreshDriver, VideoTiming},
    },
};

/// Soft caps that make the demuxer back off instead of flooding memory.
pub const AUDIO_QUEUE_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const VIDEO_QUEUE_MAX_BYTES: usize = 5 * 256 * 1024;

/// Pause flag shared by every pipeline stage. `wait_if_paused` is the only
/// approved way for producers and consumers to hold still; pairing the wait
/// with the quit flag keeps shutdown prompt.
pub struct PauseGate {
    paused: Mutex<bool>,
    cond: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Flips the flag and wakes waiters on resume. Returns the new state.
    pub fn toggle(&self) -> bool {
        let mut paused = self.paused.lock();
        *paused = !*paused;
        if !*paused {
            self.cond.notify_all();
        }
        *paused
    }

    pub fn wait_if_paused(&self, quit: &AtomicBool) {
        self.wait_if_paused_unless(quit, || false);
    }

    /// Blocks while paused, with an extra escape predicate for waiters that
    /// must keep servicing work during a pause (the demuxer and pending
    /// seeks).
    pub fn wait_if_paused_unless(&self, quit: &AtomicBool, escape: impl Fn() -> bool) {
        let mut paused = self.paused.lock();
        while *paused && !quit.load(Ordering::Acquire) && !escape() {
            self.cond.wait(&mut paused);
        }
    }

    /// Wakes every waiter without changing the flag; used for quit and for
    /// kicking a paused demuxer toward a fresh seek request.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One seek, as filed by the control loop and executed by the demuxer.
#[derive(Debug, Clone, Copy)]
pub struct SeekRequest {
    /// Target position in `AV_TIME_BASE` units.
    pub target: i64,
    /// The relative increment that produced the target, in seconds.
    pub rel: f64,
    pub backward: bool,
}

struct SeekFields {
    request: Option<SeekRequest>,
    complete: bool,
}

/// Request mailbox between the control loop and the demuxer. At most one
/// seek is in flight; requests filed while one is pending or executing are
/// coalesced away.
pub struct SeekState {
    fields: Mutex<SeekFields>,
}

impl SeekState {
    pub fn new() -> Self {
        Self {
            fields: Mutex::new(SeekFields {
                request: None,
                complete: true,
            }),
        }
    }

    /// Files a request; returns whether it was accepted.
    pub fn request(&self, request: SeekRequest) -> bool {
        let mut fields = self.fields.lock();
        if fields.request.is_none() && fields.complete {
            fields.request = Some(request);
            fields.complete = false;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> bool {
        self.fields.lock().request.is_some()
    }

    /// Demuxer side: claims the request for execution. `finish` must follow.
    pub fn take(&self) -> Option<SeekRequest> {
        self.fields.lock().request.take()
    }

    pub fn finish(&self) {
        let mut fields = self.fields.lock();
        fields.request = None;
        fields.complete = true;
    }
}

impl Default for SeekState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioStreamInfo {
    pub index: usize,
    pub time_base: ffmpeg::Rational,
    pub rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub time_base: ffmpeg::Rational,
    pub width: u32,
    pub height: u32,
    pub aspect: f64,
}

/// The single owner of everything the workers share. Workers hold an
/// `Arc<PlayerState>` and observe disjoint fields under their own locks.
pub struct PlayerState {
    pub sync: Arc<SyncState>,
    pub audio_queue: PacketQueue,
    pub video_queue: PacketQueue,
    pub pictures: Arc<PictureQueue>,
    pub video_timing: Arc<Mutex<VideoTiming>>,
    pub pause: PauseGate,
    pub seek: SeekState,
    pub quit: AtomicBool,
    pub audio: Option<AudioStreamInfo>,
    pub video: Option<VideoStreamInfo>,
    /// Media duration in seconds, 0 when the container does not know.
    pub duration: f64,
}

impl PlayerState {
    fn new(
        sync: Arc<SyncState>,
        audio: Option<AudioStreamInfo>,
        video: Option<VideoStreamInfo>,
        duration: f64,
    ) -> Self {
        let now = sync.wall_seconds();
        Self {
            sync,
            audio_queue: PacketQueue::new("audio"),
            video_queue: PacketQueue::new("video"),
            pictures: Arc::new(PictureQueue::new()),
            video_timing: Arc::new(Mutex::new(VideoTiming::new(now))),
            pause: PauseGate::new(),
            seek: SeekState::new(),
            quit: AtomicBool::new(false),
            audio,
            video,
            duration,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(sync: Arc<SyncState>) -> Self {
        Self::new(sync, None, None, 0.0)
    }

    pub fn quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Raises the quit flag and unblocks every suspension point so workers
    /// exit promptly.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.pause.notify_all();
        self.audio_queue.abort();
        self.video_queue.abort();
        self.pictures.abort();
    }
}

/// The running player: shared state plus the worker threads and the audio
/// device stream. Owned by the UI shell on the main thread; dropping it
/// tears the whole pipeline down.
pub struct Player {
    state: Arc<PlayerState>,
    events: flume::Sender<PlayerEvent>,
    control: Option<thread::JoinHandle<()>>,
    demux: Option<thread::JoinHandle<()>>,
    video_decode: Option<thread::JoinHandle<()>>,
    audio_output: Option<AudioOutput>,
}

impl Player {
    pub fn open(url: &str, sink: Box<dyn PictureSink>) -> Result<Self> {
        let mut ictx = ffmpeg::format::input(url).map_err(|source| PlayerError::Open {
            url: url.to_owned(),
            source,
        })?;

        let audio_parts = match ictx.streams().best(ffmpeg::media::Type::Audio) {
            Some(stream) => Some(audio::open_stream(&stream)?),
            None => None,
        };
        let video_parts = match ictx.streams().best(ffmpeg::media::Type::Video) {
            Some(stream) => Some(video::open_stream(&stream)?),
            None => None,
        };
        if audio_parts.is_none() && video_parts.is_none() {
            return Err(PlayerError::NoStream);
        }

        let mode = if audio_parts.is_some() {
            SyncMode::AudioMaster
        } else {
            SyncMode::VideoMaster
        };
        let (rate, channels) = audio_parts
            .as_ref()
            .map_or((0, 0), |(_, info)| (info.rate, info.channels));
        let sync = Arc::new(SyncState::new(mode, rate, channels));

        let duration = ictx.duration();
        let duration = if duration > 0 {
            duration as f64 / ffmpeg::sys::AV_TIME_BASE as f64
        } else {
            0.0
        };

        let state = Arc::new(PlayerState::new(
            sync.clone(),
            audio_parts.as_ref().map(|(_, info)| *info),
            video_parts.as_ref().map(|(_, info)| *info),
            duration,
        ));
        discard_unused_streams(&mut ictx, &state);
        info!(
            url,
            duration,
            audio = state.audio.is_some(),
            video = state.video.is_some(),
            mode = ?sync.mode(),
            "input opened"
        );

        let (events_tx, events_rx) = flume::unbounded::<PlayerEvent>();

        let audio_output = match audio_parts {
            Some((decoder, info)) => Some(audio::output::start(state.clone(), decoder, &info)?),
            None => None,
        };
        let video_decode =
            video_parts.map(|(decoder, info)| video::spawn_decoder(state.clone(), decoder, &info));
        let demux = demux::spawn(ictx, state.clone(), events_tx.clone());

        let driver = RefreshDriver::new(
            sync.clone(),
            state.pictures.clone(),
            state.video_timing.clone(),
            master_source(&sync),
            RefreshTimer::spawn(events_tx.clone()),
            sink,
            state.video.is_some(),
        );
        let muted = audio_output.as_ref().map(AudioOutput::muted_flag);
        let control = {
            let state = state.clone();
            thread::Builder::new()
                .name("control".into())
                .spawn(move || control_loop(&state, &events_rx, driver, muted))
                .expect("failed to spawn control thread")
        };

        Ok(Self {
            state,
            events: events_tx,
            control: Some(control),
            demux: Some(demux),
            video_decode,
            audio_output,
        })
    }

    /// Command channel for the UI shell.
    pub fn events(&self) -> flume::Sender<PlayerEvent> {
        self.events.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.pause.is_paused()
    }

    /// Stops every worker and waits for them. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.state.request_quit();
        let _ = self.events.send(PlayerEvent::Quit);
        for handle in [
            self.control.take(),
            self.demux.take(),
            self.video_decode.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }
        // joins the fill thread and closes the device stream
        self.audio_output.take();
        info!("player torn down");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn discard_unused_streams(ictx: &mut ffmpeg::format::context::Input, state: &PlayerState) {
    let audio_index = state.audio.map(|info| info.index);
    let video_index = state.video.map(|info| info.index);
    for mut stream in ictx.streams_mut() {
        let index = stream.index();
        if Some(index) != audio_index && Some(index) != video_index {
            unsafe {
                (*stream.as_mut_ptr()).discard = ffmpeg::sys::AVDiscard::AVDISCARD_ALL;
            }
            debug!(index, "discarding unused stream");
        }
    }
}

fn control_loop(
    state: &Arc<PlayerState>,
    events: &flume::Receiver<PlayerEvent>,
    mut driver: RefreshDriver,
    audio_muted: Option<Arc<AtomicBool>>,
) {
    driver.start();
    loop {
        if state.quitting() {
            break;
        }
        let Ok(event) = events.recv() else {
            break;
        };
        match event {
            PlayerEvent::Refresh => driver.on_refresh(),
            PlayerEvent::TogglePause => toggle_pause(state, audio_muted.as_deref()),
            PlayerEvent::SeekBy(incr) => handle_seek(state, incr),
            PlayerEvent::Quit => {
                state.request_quit();
                break;
            }
        }
    }
    driver.stop();
    debug!("control loop exited");
}

fn toggle_pause(state: &PlayerState, audio_muted: Option<&AtomicBool>) {
    let paused = state.pause.toggle();
    if let Some(muted) = audio_muted {
        muted.store(paused, Ordering::Release);
    }
    if !paused {
        // re-anchor pacing so the scheduler does not sprint through the gap
        state.video_timing.lock().frame_timer = state.sync.wall_seconds();
    }
    info!(paused, "playback {}", if paused { "paused" } else { "resumed" });
}

fn handle_seek(state: &PlayerState, incr: f64) {
    let pos = state.sync.master_clock();
    let pos = if pos.is_finite() { pos } else { 0.0 };
    let mut target = pos + incr;
    if target < 0.0 {
        target = 0.0;
    }
    if state.duration > 0.0 && target > state.duration {
        target = (state.duration - 1.0).max(0.0);
    }

    let request = SeekRequest {
        target: (target * ffmpeg::sys::AV_TIME_BASE as f64) as i64,
        rel: incr,
        backward: incr < 0.0,
    };
    if state.seek.request(request) {
        state.sync.reset_clock(target);
        // a paused demuxer must still wake up and execute the seek
        state.pause.notify_all();
        info!(from = pos, to = target, "seek requested");
    } else {
        debug!(incr, "seek already in flight, request dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn test_state(duration: f64) -> Arc<PlayerState> {
        let sync = Arc::new(SyncState::new(SyncMode::VideoMaster, 0, 0));
        Arc::new(PlayerState::new(sync, None, None, duration))
    }

    fn seek_target_secs(state: &PlayerState) -> f64 {
        let request = state.seek.take().expect("request should be filed");
        state.seek.finish();
        request.target as f64 / ffmpeg::sys::AV_TIME_BASE as f64
    }

    #[test]
    fn pause_toggle_even_number_of_times_is_identity() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        assert!(gate.toggle());
        assert!(!gate.toggle());
        assert!(!gate.is_paused());
    }

    #[test]
    fn wait_if_paused_blocks_until_resume() {
        let state = test_state(0.0);
        state.pause.toggle();

        let waiter = {
            let state = state.clone();
            thread::spawn(move || {
                state.pause.wait_if_paused(&state.quit);
                Instant::now()
            })
        };
        thread::sleep(Duration::from_millis(50));
        let resumed_at = Instant::now();
        state.pause.toggle();
        let woke_at = waiter.join().unwrap();
        assert!(woke_at >= resumed_at);
    }

    #[test]
    fn quit_releases_paused_workers_quickly() {
        let state = test_state(0.0);
        state.pause.toggle();

        let waiter = {
            let state = state.clone();
            thread::spawn(move || state.pause.wait_if_paused(&state.quit))
        };
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        state.request_quit();
        waiter.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn escape_predicate_lets_demuxer_run_while_paused() {
        let state = test_state(0.0);
        state.pause.toggle();

        let waiter = {
            let state = state.clone();
            thread::spawn(move || {
                state
                    .pause
                    .wait_if_paused_unless(&state.quit, || state.seek.pending());
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(state.seek.request(SeekRequest {
            target: 0,
            rel: 1.0,
            backward: false,
        }));
        state.pause.notify_all();
        waiter.join().unwrap();
    }

    #[test]
    fn seek_requests_coalesce_while_one_is_in_flight() {
        let seek = SeekState::new();
        let request = SeekRequest {
            target: 100,
            rel: 10.0,
            backward: false,
        };
        assert!(seek.request(request));
        assert!(!seek.request(request), "second request must be dropped");

        let claimed = seek.take().unwrap();
        assert_eq!(claimed.target, 100);
        // still executing: not complete, so new requests stay rejected
        assert!(!seek.request(request));

        seek.finish();
        assert!(seek.request(request));
    }

    #[test]
    fn handle_seek_files_request_and_resets_clocks() {
        let state = test_state(300.0);
        state.sync.set_next_video_pts(2.0);
        handle_seek(&state, 10.0);
        assert!((seek_target_secs(&state) - 12.0).abs() < 1e-6);
        assert!((state.sync.master_clock() - 12.0).abs() < 0.05);
    }

    #[test]
    fn backward_seek_clamps_to_start() {
        let state = test_state(300.0);
        state.sync.set_next_video_pts(5.0);
        handle_seek(&state, -60.0);
        let request = state.seek.take().unwrap();
        assert_eq!(request.target, 0);
        assert!(request.backward);
    }

    #[test]
    fn forward_seek_clamps_below_duration() {
        let state = test_state(30.0);
        state.sync.set_next_video_pts(25.0);
        handle_seek(&state, 10.0);
        assert!((seek_target_secs(&state) - 29.0).abs() < 1e-6);
    }

    #[test]
    fn seek_while_one_pending_does_not_move_the_clock_again() {
        let state = test_state(300.0);
        state.sync.set_next_video_pts(2.0);
        handle_seek(&state, 10.0);
        handle_seek(&state, 10.0);
        let request = state.seek.take().unwrap();
        assert!((request.target as f64 / ffmpeg::sys::AV_TIME_BASE as f64 - 12.0).abs() < 1e-6);
    }
}

use std::{sync::Arc, thread, time::Duration};

use ffmpeg_next::{self as ffmpeg, sys};
use tracing::{debug, error, info, trace, warn};

use crate::media::{
    AUDIO_QUEUE_MAX_BYTES, PlayerState, SeekRequest, VIDEO_QUEUE_MAX_BYTES,
    events::PlayerEvent,
    queue::QueuedPacket,
};

/// How long to back off when a packet queue is over its soft cap. Sleeping
/// instead of blocking keeps the loop cancellable.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);
/// EOF is transient: a later backward seek can revive the stream.
const EOF_RETRY: Duration = Duration::from_millis(100);

pub fn spawn(
    ictx: ffmpeg::format::context::Input,
    state: Arc<PlayerState>,
    events: flume::Sender<PlayerEvent>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("demux".into())
        .spawn(move || demux_loop(ictx, &state, &events))
        .expect("failed to spawn demux thread")
}

fn demux_loop(
    mut ictx: ffmpeg::format::context::Input,
    state: &PlayerState,
    events: &flume::Sender<PlayerEvent>,
) {
    let audio_index = state.audio.map(|info| info.index);
    let video_index = state.video.map(|info| info.index);
    let mut io_paused = false;

    loop {
        if state.quitting() {
            break;
        }

        // mirror the gate into the io layer; matters for network sources
        let paused = state.pause.is_paused();
        if paused != io_paused {
            io_paused = paused;
            let result = if paused { ictx.pause() } else { ictx.play() };
            if let Err(err) = result {
                trace!(%err, "read pause/play not supported");
            }
        }
        state
            .pause
            .wait_if_paused_unless(&state.quit, || state.seek.pending());
        if state.quitting() {
            break;
        }

        if let Some(request) = state.seek.take() {
            execute_seek(&mut ictx, state, &request);
            state.seek.finish();
            continue;
        }

        if state.audio_queue.size_bytes() > AUDIO_QUEUE_MAX_BYTES
            || state.video_queue.size_bytes() > VIDEO_QUEUE_MAX_BYTES
        {
            thread::sleep(QUEUE_FULL_BACKOFF);
            continue;
        }

        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut ictx) {
            Ok(()) => {
                let index = Some(packet.stream());
                if index == audio_index {
                    state.audio_queue.put(QueuedPacket::Data(packet));
                } else if index == video_index {
                    state.video_queue.put(QueuedPacket::Data(packet));
                }
                // packets of other streams are dropped on the floor
            }
            Err(ffmpeg::Error::Eof) => {
                trace!("demuxer at eof, waiting");
                thread::sleep(EOF_RETRY);
            }
            Err(err) => {
                error!(%err, "read failed, stopping demuxer");
                let _ = events.send(PlayerEvent::Quit);
                break;
            }
        }
    }
    debug!("demuxer exited");
}

/// Executes one seek against the format context: rescale the target into the
/// reference stream's time base, seek, then flush both pipelines and reset
/// the video pacing state. The flush markers enqueued here make the decoders
/// reset themselves downstream.
fn execute_seek(
    ictx: &mut ffmpeg::format::context::Input,
    state: &PlayerState,
    request: &SeekRequest,
) {
    let Some((stream_index, time_base)) = state
        .audio
        .map(|info| (info.index, info.time_base))
        .or_else(|| state.video.map(|info| (info.index, info.time_base)))
    else {
        return;
    };

    let stream_tb = sys::AVRational {
        num: time_base.numerator(),
        den: time_base.denominator(),
    };
    let global_tb = sys::AVRational {
        num: 1,
        den: sys::AV_TIME_BASE as i32,
    };
    let target = unsafe { sys::av_rescale_q(request.target, global_tb, stream_tb) };
    let rel_ts = unsafe {
        sys::av_rescale_q(
            (request.rel.abs() * sys::AV_TIME_BASE as f64) as i64,
            global_tb,
            stream_tb,
        )
    };
    // a forward seek is bounded around the target, a backward one snaps to
    // the keyframe at or before it
    let (seek_min, seek_max) = if request.rel > 0.0 {
        (target - rel_ts + 2, target + rel_ts - 2)
    } else {
        (i64::MIN, i64::MAX)
    };
    let flags = if request.backward {
        sys::AVSEEK_FLAG_BACKWARD as i32
    } else {
        0
    };

    let ret = unsafe {
        sys::avformat_seek_file(
            ictx.as_mut_ptr(),
            stream_index as i32,
            seek_min,
            target,
            seek_max,
            flags,
        )
    };
    if ret < 0 {
        warn!(seek_target = target, stream_index, "seek failed, continuing in place");
        return;
    }

    let target_secs = request.target as f64 / sys::AV_TIME_BASE as f64;
    if state.audio.is_some() {
        state.audio_queue.flush();
        state.sync.set_audio_clock(target_secs);
        state.audio_queue.put(QueuedPacket::Flush);
    }
    if state.video.is_some() {
        state.video_queue.flush();
        state.video_queue.put(QueuedPacket::Flush);
        state.video_timing.lock().reset(state.sync.wall_seconds());
        state.sync.reset_video_position();
    }
    info!(target_secs, "seek executed");
}

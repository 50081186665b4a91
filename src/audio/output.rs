use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ffmpeg_next as ffmpeg;
use ringbuf::{Consumer, Producer, RingBuffer};
use tracing::{debug, error};

use crate::{
    audio::decoder::AudioDecoder,
    error::{PlayerError, Result},
    media::{
        AudioStreamInfo, PlayerState,
        queue::{PacketGet, QueuedPacket},
        sync::{DriftCorrector, SyncMode, SyncState},
    },
};

/// The running audio side: the device stream (alive as long as this is),
/// the fill thread and the mute flag the control loop flips on pause.
///
/// The fill thread decodes and resamples into a lock-free ring; the device
/// callback drains it. The callback never blocks on pipeline locks — when
/// starved or muted it emits silence.
pub struct AudioOutput {
    _stream: cpal::Stream,
    muted: Arc<AtomicBool>,
    fill: Option<thread::JoinHandle<()>>,
}

impl AudioOutput {
    pub fn muted_flag(&self) -> Arc<AtomicBool> {
        self.muted.clone()
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        if let Some(handle) = self.fill.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn start(
    state: Arc<PlayerState>,
    decoder: ffmpeg::codec::decoder::Audio,
    info: &AudioStreamInfo,
) -> Result<AudioOutput> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlayerError::NoAudioDevice)?;
    let config = cpal::StreamConfig {
        channels: info.channels,
        sample_rate: cpal::SampleRate(info.rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // half a second of headroom between the fill thread and the callback
    let ring_capacity = ((state.sync.audio_bytes_per_sec() as usize / 2) / 2).max(8192);
    let (producer, mut consumer) = RingBuffer::<i16>::new(ring_capacity).split();

    let muted = Arc::new(AtomicBool::new(false));
    let ring_flush = Arc::new(AtomicBool::new(false));

    let stream = {
        let sync = state.sync.clone();
        let muted = muted.clone();
        let ring_flush = ring_flush.clone();
        device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    device_callback(data, &mut consumer, &sync, &muted, &ring_flush)
                },
                |err| error!(%err, "audio stream error"),
                None::<Duration>,
            )
            .map_err(|err| PlayerError::AudioDevice(err.to_string()))?
    };
    stream
        .play()
        .map_err(|err| PlayerError::AudioDevice(err.to_string()))?;

    let fill = {
        let info = *info;
        let ring_flush = ring_flush.clone();
        thread::Builder::new()
            .name("audio-fill".into())
            .spawn(move || fill_loop(&state, decoder, info, producer, &ring_flush))
            .expect("failed to spawn audio fill thread")
    };

    Ok(AudioOutput {
        _stream: stream,
        muted,
        fill: Some(fill),
    })
}

/// Decode, resample, drift-correct, publish. Runs until quit or queue
/// abort.
fn fill_loop(
    state: &PlayerState,
    decoder: ffmpeg::codec::decoder::Audio,
    info: AudioStreamInfo,
    mut producer: Producer<i16>,
    ring_flush: &AtomicBool,
) {
    let mut decoder = match AudioDecoder::new(decoder, info.time_base) {
        Ok(decoder) => decoder,
        Err(err) => {
            // the resampler was probed at open, this is out of memory terrain
            error!(%err, "audio decoder setup failed");
            return;
        }
    };
    let mut corrector = DriftCorrector::new(info.rate, info.channels);
    let audio_is_master = state.sync.mode() == SyncMode::AudioMaster;

    loop {
        state.pause.wait_if_paused(&state.quit);
        if state.quitting() {
            break;
        }
        match state.audio_queue.get(true) {
            PacketGet::Aborted => break,
            PacketGet::Empty => continue,
            PacketGet::Packet(QueuedPacket::Flush) => {
                decoder.flush();
                corrector.reset();
                // the callback empties the ring on its next run
                ring_flush.store(true, Ordering::Release);
                debug!("audio pipeline flushed");
            }
            PacketGet::Packet(QueuedPacket::Data(packet)) => {
                let Some(mut chunk) = decoder.decode(&packet) else {
                    continue;
                };
                if let Some(pts) = chunk.pts {
                    state.sync.set_audio_clock(pts);
                }
                // the clock word tracks the media duration of the chunk,
                // before any drift resize stretches its wall duration
                state.sync.advance_audio_clock(chunk.samples.len() * 2);
                if !audio_is_master {
                    let diff = state.sync.audio_clock() - state.sync.master_clock();
                    corrector.apply(&mut chunk.samples, diff);
                }
                state.sync.add_pending_audio(chunk.samples.len() * 2);
                push_samples(&mut producer, &chunk.samples, state);
            }
        }
    }
    debug!("audio fill exited");
}

fn push_samples(producer: &mut Producer<i16>, samples: &[i16], state: &PlayerState) {
    let mut offset = 0;
    while offset < samples.len() {
        if state.quitting() {
            return;
        }
        let pushed = producer.push_slice(&samples[offset..]);
        if pushed == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        offset += pushed;
    }
}

/// Runs on the device thread. Lock-free by construction: ring pops plus
/// atomic clock accounting only.
fn device_callback(
    data: &mut [i16],
    consumer: &mut Consumer<i16>,
    sync: &SyncState,
    muted: &AtomicBool,
    ring_flush: &AtomicBool,
) {
    if ring_flush.swap(false, Ordering::AcqRel) {
        let mut stale = 0usize;
        while consumer.pop().is_some() {
            stale += 1;
        }
        if stale > 0 {
            sync.take_played_audio(stale * 2);
        }
    }

    if muted.load(Ordering::Acquire) {
        // paused: silence without consuming, so buffered audio and the
        // clock survive the pause intact
        data.fill(0);
        return;
    }

    let got = consumer.pop_slice(data);
    data[got..].fill(0);
    if got > 0 {
        sync.take_played_audio(got * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_state() -> SyncState {
        SyncState::new(SyncMode::AudioMaster, 48_000, 2)
    }

    #[test]
    fn callback_drains_ring_and_accounts_played_bytes() {
        let sync = sync_state();
        let (mut producer, mut consumer) = RingBuffer::<i16>::new(64).split();
        let muted = AtomicBool::new(false);
        let flush = AtomicBool::new(false);

        sync.set_audio_clock(1.0);
        let samples: Vec<i16> = (0..32).collect();
        sync.add_pending_audio(samples.len() * 2);
        assert_eq!(producer.push_slice(&samples), 32);

        let mut out = [0i16; 16];
        device_callback(&mut out, &mut consumer, &sync, &muted, &flush);
        assert_eq!(&out[..4], &[0, 1, 2, 3]);
        // 32 pending bytes played out of 64
        let expected = 1.0 - 32.0 / sync.audio_bytes_per_sec();
        assert!((sync.audio_clock() - expected).abs() < 1e-9);
    }

    #[test]
    fn starved_callback_emits_silence() {
        let sync = sync_state();
        let (_producer, mut consumer) = RingBuffer::<i16>::new(16).split();
        let muted = AtomicBool::new(false);
        let flush = AtomicBool::new(false);

        let mut out = [7i16; 8];
        device_callback(&mut out, &mut consumer, &sync, &muted, &flush);
        assert_eq!(out, [0i16; 8]);
    }

    #[test]
    fn muted_callback_does_not_consume_the_ring() {
        let sync = sync_state();
        let (mut producer, mut consumer) = RingBuffer::<i16>::new(64).split();
        let muted = AtomicBool::new(true);
        let flush = AtomicBool::new(false);

        sync.set_audio_clock(2.0);
        sync.add_pending_audio(32);
        producer.push_slice(&[5i16; 16]);
        let clock_before = sync.audio_clock();

        let mut out = [9i16; 8];
        device_callback(&mut out, &mut consumer, &sync, &muted, &flush);
        assert_eq!(out, [0i16; 8]);
        assert_eq!(consumer.len(), 16);
        assert_eq!(sync.audio_clock(), clock_before);
    }

    #[test]
    fn flush_flag_drops_stale_samples_once() {
        let sync = sync_state();
        let (mut producer, mut consumer) = RingBuffer::<i16>::new(64).split();
        let muted = AtomicBool::new(false);
        let flush = AtomicBool::new(true);

        sync.set_audio_clock(5.0);
        sync.add_pending_audio(32);
        producer.push_slice(&[3i16; 16]);

        let mut out = [1i16; 8];
        device_callback(&mut out, &mut consumer, &sync, &muted, &flush);
        // stale ring content dropped, nothing left to play
        assert_eq!(out, [0i16; 8]);
        assert!(!flush.load(Ordering::Acquire));
        assert_eq!(consumer.len(), 0);
        // pending accounting returned to zero exactly
        assert_eq!(sync.audio_clock(), 5.0);
    }

    #[test]
    fn push_samples_moves_everything_through_a_small_ring() {
        let state = {
            let sync = Arc::new(sync_state());
            Arc::new(crate::media::PlayerState::new_for_tests(sync))
        };
        let (mut producer, mut consumer) = RingBuffer::<i16>::new(8).split();
        let samples: Vec<i16> = (0..64).collect();

        let drainer = {
            let state = state.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 64 && !state.quitting() {
                    if let Some(sample) = consumer.pop() {
                        seen.push(sample);
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                seen
            })
        };
        push_samples(&mut producer, &samples, &state);
        let seen = drainer.join().unwrap();
        assert_eq!(seen, samples);
    }
}

use ffmpeg_next::{self as ffmpeg, util::frame::Audio as AudioFrame};
use tracing::warn;

/// Output sample format pushed to the device: S16 interleaved at the
/// stream's own rate and layout.
pub(crate) fn build_resampler(
    decoder: &ffmpeg::codec::decoder::Audio,
) -> Result<ffmpeg::software::resampling::Context, ffmpeg::Error> {
    ffmpeg::software::resampling::Context::get(
        decoder.format(),
        decoder.channel_layout(),
        decoder.rate(),
        ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
        decoder.channel_layout(),
        decoder.rate(),
    )
}

/// One packet's worth of resampled output.
pub struct DecodedChunk {
    pub samples: Vec<i16>,
    /// Packet DTS mapped to seconds; `None` when the container left it
    /// undefined and the running clock should stand.
    pub pts: Option<f64>,
}

/// Queue-fed audio decoder: packets in, S16 interleaved chunks out.
pub struct AudioDecoder {
    decoder: ffmpeg::codec::decoder::Audio,
    resampler: ffmpeg::software::resampling::Context,
    time_base: f64,
}

impl AudioDecoder {
    pub fn new(
        decoder: ffmpeg::codec::decoder::Audio,
        time_base: ffmpeg::Rational,
    ) -> Result<Self, ffmpeg::Error> {
        let resampler = build_resampler(&decoder)?;
        Ok(Self {
            decoder,
            resampler,
            time_base: f64::from(time_base),
        })
    }

    /// Decodes one packet and drains every frame the decoder produces for
    /// it. Returns `None` when the packet yields nothing; decode errors are
    /// logged and swallowed so playback continues.
    pub fn decode(&mut self, packet: &ffmpeg::Packet) -> Option<DecodedChunk> {
        if let Err(err) = self.decoder.send_packet(packet) {
            warn!(%err, "dropping undecodable audio packet");
            return None;
        }

        let mut samples = Vec::new();
        let mut frame = AudioFrame::empty();
        loop {
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let mut resampled = AudioFrame::empty();
                    match self.resampler.run(&frame, &mut resampled) {
                        Ok(_) => append_interleaved_s16(&resampled, &mut samples),
                        Err(err) => warn!(%err, "audio resample failed, frame dropped"),
                    }
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::sys::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(err) => {
                    warn!(%err, "audio decode failed");
                    break;
                }
            }
        }

        if samples.is_empty() {
            return None;
        }
        let pts = packet.dts().map(|dts| dts as f64 * self.time_base);
        Some(DecodedChunk { samples, pts })
    }

    /// Drops decoder state across a seek discontinuity.
    pub fn flush(&mut self) {
        self.decoder.flush();
    }
}

fn append_interleaved_s16(frame: &AudioFrame, out: &mut Vec<i16>) {
    // packed S16: plane 0 holds the interleaved samples, the plane buffer
    // may be padded past the audible payload
    let payload = frame.samples() * usize::from(frame.channels()) * 2;
    let data = &frame.data(0)[..payload];
    out.reserve(payload / 2);
    out.extend(
        data.chunks_exact(2)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]])),
    );
}

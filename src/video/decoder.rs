use ffmpeg_next::{self as ffmpeg, util::frame::Video as VideoFrame};
use tracing::{debug, error, warn};

use crate::{
    media::{
        PlayerState, VideoStreamInfo,
        queue::{PacketGet, QueuedPacket},
        sync::synchronize_video,
    },
    video::picture::Picture,
};

pub(crate) fn build_scaler(
    decoder: &ffmpeg::codec::decoder::Video,
) -> Result<ffmpeg::software::scaling::Context, ffmpeg::Error> {
    ffmpeg::software::scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg::format::Pixel::RGBA,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
}

/// Video worker: packets in, paced pictures out through the single-slot
/// picture queue.
pub(crate) fn decode_loop(
    state: &PlayerState,
    mut decoder: ffmpeg::codec::decoder::Video,
    info: VideoStreamInfo,
) {
    let mut scaler = match build_scaler(&decoder) {
        Ok(scaler) => scaler,
        Err(err) => {
            error!(%err, "video scaler setup failed");
            return;
        }
    };
    let time_base = f64::from(info.time_base);
    let mut frame = VideoFrame::empty();
    let mut rgba = VideoFrame::empty();

    loop {
        state.pause.wait_if_paused(&state.quit);
        if state.quitting() {
            break;
        }
        match state.video_queue.get(true) {
            PacketGet::Aborted => break,
            PacketGet::Empty => continue,
            PacketGet::Packet(QueuedPacket::Flush) => {
                decoder.flush();
                debug!("video decoder flushed");
            }
            PacketGet::Packet(QueuedPacket::Data(packet)) => {
                if !decode_packet(
                    state, &mut decoder, &mut scaler, &packet, time_base, info.aspect, &mut frame,
                    &mut rgba,
                ) {
                    // picture queue aborted under us
                    break;
                }
            }
        }
    }
    debug!("video decoder exited");
}

#[allow(clippy::too_many_arguments)]
fn decode_packet(
    state: &PlayerState,
    decoder: &mut ffmpeg::codec::decoder::Video,
    scaler: &mut ffmpeg::software::scaling::Context,
    packet: &ffmpeg::Packet,
    time_base: f64,
    aspect: f64,
    frame: &mut VideoFrame,
    rgba: &mut VideoFrame,
) -> bool {
    if let Err(err) = decoder.send_packet(packet) {
        warn!(%err, "dropping undecodable video packet");
        return true;
    }

    loop {
        match decoder.receive_frame(frame) {
            Ok(()) => {
                // DTS when the container has one, the decoder's best-effort
                // stamp otherwise; zero falls through to the running clock
                let pts_units = packet.dts().or_else(|| frame.timestamp());
                let pts = pts_units.map_or(0.0, |units| units as f64 * time_base);
                let repeat = unsafe { (*frame.as_ptr()).repeat_pict } as f64;
                let pts = synchronize_video(&state.sync, pts, time_base, repeat);

                if let Err(err) = scaler.run(frame, rgba) {
                    warn!(%err, "scale failed, frame dropped");
                    continue;
                }
                let picture = Picture {
                    data: tight_rgba(rgba),
                    width: rgba.width(),
                    height: rgba.height(),
                    pts,
                    aspect,
                };
                if !state.pictures.put(picture) {
                    return false;
                }
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::sys::EAGAIN => return true,
            Err(ffmpeg::Error::Eof) => return true,
            Err(err) => {
                warn!(%err, "video decode failed");
                return true;
            }
        }
    }
}

/// Copies the RGBA plane row by row, dropping the allocator's stride
/// padding so the picture buffer is exactly `width * height * 4` bytes.
fn tight_rgba(frame: &VideoFrame) -> Vec<u8> {
    let row_bytes = frame.width() as usize * 4;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return data[..row_bytes * height].to_vec();
    }
    let mut out = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        out.extend_from_slice(&data[start..start + row_bytes]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tight_rgba_strips_stride_padding() {
        let mut frame = VideoFrame::new(ffmpeg::format::Pixel::RGBA, 2, 2);
        let stride = frame.stride(0);
        assert!(stride >= 8);
        {
            let data = frame.data_mut(0);
            for row in 0..2usize {
                for byte in 0..8usize {
                    data[row * stride + byte] = (row * 8 + byte) as u8;
                }
            }
        }
        let tight = tight_rgba(&frame);
        assert_eq!(tight.len(), 16);
        let expected: Vec<u8> = (0..16).collect();
        assert_eq!(tight, expected);
    }
}

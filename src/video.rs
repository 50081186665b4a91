pub mod decoder;
pub mod display;
pub mod picture;
pub mod refresh;

use std::{sync::Arc, thread};

use ffmpeg_next as ffmpeg;
use tracing::info;

use crate::{
    error::{PlayerError, Result},
    media::{PlayerState, VideoStreamInfo},
    video::display::display_aspect,
};

/// Opens the video decoder for a stream and probes the scaler setup; like
/// the audio side, the worker thread rebuilds its own scaling context.
pub(crate) fn open_stream(
    stream: &ffmpeg::format::stream::Stream,
) -> Result<(ffmpeg::codec::decoder::Video, VideoStreamInfo)> {
    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters()).map_err(
        |source| PlayerError::Decoder {
            kind: "video",
            source,
        },
    )?;
    let decoder = context
        .decoder()
        .video()
        .map_err(|source| PlayerError::Decoder {
            kind: "video",
            source,
        })?;

    decoder::build_scaler(&decoder).map_err(PlayerError::Scaler)?;

    let sar = decoder.aspect_ratio();
    let info = VideoStreamInfo {
        index: stream.index(),
        time_base: stream.time_base(),
        width: decoder.width(),
        height: decoder.height(),
        aspect: display_aspect(
            decoder.width(),
            decoder.height(),
            sar.numerator(),
            sar.denominator(),
        ),
    };
    info!(
        index = info.index,
        width = info.width,
        height = info.height,
        "video stream opened"
    );
    Ok((decoder, info))
}

pub(crate) fn spawn_decoder(
    state: Arc<PlayerState>,
    decoder: ffmpeg::codec::decoder::Video,
    info: &VideoStreamInfo,
) -> thread::JoinHandle<()> {
    let info = *info;
    thread::Builder::new()
        .name("video-decode".into())
        .spawn(move || decoder::decode_loop(&state, decoder, info))
        .expect("failed to spawn video decode thread")
}

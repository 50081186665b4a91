pub mod decoder;
pub mod output;

use ffmpeg_next as ffmpeg;
use tracing::info;

use crate::{
    error::{PlayerError, Result},
    media::AudioStreamInfo,
};

/// Opens the audio decoder for a stream and probes the resampler setup so an
/// unsupported sample layout fails at startup instead of inside the fill
/// thread (which rebuilds its own resampler; swr contexts stay on the thread
/// that uses them).
pub(crate) fn open_stream(
    stream: &ffmpeg::format::stream::Stream,
) -> Result<(ffmpeg::codec::decoder::Audio, AudioStreamInfo)> {
    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters()).map_err(
        |source| PlayerError::Decoder {
            kind: "audio",
            source,
        },
    )?;
    let decoder = context
        .decoder()
        .audio()
        .map_err(|source| PlayerError::Decoder {
            kind: "audio",
            source,
        })?;

    decoder::build_resampler(&decoder).map_err(PlayerError::Resampler)?;

    let info = AudioStreamInfo {
        index: stream.index(),
        time_base: stream.time_base(),
        rate: decoder.rate(),
        channels: decoder.channels(),
    };
    info!(
        index = info.index,
        rate = info.rate,
        channels = info.channels,
        "audio stream opened"
    );
    Ok((decoder, info))
}

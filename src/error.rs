use ffmpeg_next as ffmpeg;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlayerError>;

/// Fatal player errors. Everything here is raised during startup; once the
/// pipelines are running, workers recover locally (log and drop) instead of
/// surfacing errors.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to open input '{url}': {source}")]
    Open {
        url: String,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("no decodable audio or video stream in input")]
    NoStream,

    #[error("failed to open {kind} decoder: {source}")]
    Decoder {
        kind: &'static str,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("failed to initialize audio resampler: {0}")]
    Resampler(#[source] ffmpeg::Error),

    #[error("failed to initialize video scaler: {0}")]
    Scaler(#[source] ffmpeg::Error),

    #[error("no audio output device available")]
    NoAudioDevice,

    #[error("audio output device rejected stream config: {0}")]
    AudioDevice(String),
}

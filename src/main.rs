mod app;
mod audio;
mod error;
mod media;
mod video;

use std::process::ExitCode;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::error;

use crate::{
    app::{FramePublisher, PlayerApp, SharedFrame},
    media::Player,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Desktop media player with clock-synchronised audio/video playback
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path or URL of the media file to play
    path: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("off,lumen_player=info"))
        .unwrap();
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(filter)
        .init();

    if let Err(err) = ffmpeg_next::init() {
        error!(%err, "ffmpeg initialisation failed");
        return ExitCode::FAILURE;
    }

    let shared = SharedFrame::new();
    let player = match Player::open(&args.path, Box::new(FramePublisher(shared.clone()))) {
        Ok(player) => player,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(args.path.clone())
            .with_inner_size([1280.0, 720.0]),
        ..Default::default()
    };
    match eframe::run_native(
        "lumen-player",
        native_options,
        Box::new(move |cc| Box::new(PlayerApp::new(cc, player, shared))),
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "window shell failed");
            ExitCode::FAILURE
        }
    }
}

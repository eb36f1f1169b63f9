use std::process::ExitCode;
use std::sync::Arc;

use songcap::audio::{CaptureSource, CaptureSourceFactory, LoopbackSource};
use songcap::nowplaying::{NowPlayingSource, ProcessWindowSource};
use songcap::settings::load_settings;
use songcap::Recorder;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    // `log` records are bridged into the subscriber by `init()`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    log::info!(
        "Recording {:?} into {:?} at {} kbps",
        settings.player_process,
        settings.output_dir,
        settings.bitrate_kbps
    );

    let capture: Arc<dyn CaptureSourceFactory> =
        Arc::new(|| -> Box<dyn CaptureSource> { Box::new(LoopbackSource::new()) });
    let now_playing: Arc<dyn NowPlayingSource> =
        Arc::new(ProcessWindowSource::new(settings.player_process.clone()));

    let mut recorder = match Recorder::launch(settings, capture, now_playing).await {
        Ok(recorder) => recorder,
        Err(e) => {
            log::error!("Cannot record: {}", e);
            return ExitCode::FAILURE;
        }
    };

    loop {
        tokio::select! {
            // Notices are already logged where they are raised.
            notice = recorder.next_notice() => match notice {
                Some(_) => match serde_json::to_string(&recorder.status()) {
                    Ok(status) => log::debug!("Status: {}", status),
                    Err(e) => log::warn!("Failed to serialize status: {}", e),
                },
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    recorder.shutdown().await;
    ExitCode::SUCCESS
}

//! Livecap Recorder
//!
//! Headless driver for segmented live-broadcast recording: starts the
//! capture, rotates segments on a fixed interval, watches for the
//! broadcast end, then drains background conversions and assembles the
//! final video.

mod config;
mod error;
mod monitor;
mod recording;
mod segment;
mod session;
mod status;
mod tasks;
mod video;

use clap::Parser;
use session::{BroadcastTag, RecordingSession};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Automated segmented recording of live broadcasts
#[derive(Parser, Debug)]
#[command(name = "livecap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Watch page URL handed to the capture mechanism
    #[arg(long)]
    url: String,

    /// Broadcast tag: <id>_<title>_<broadcaster>_<account>
    #[arg(long)]
    tag: String,

    /// Segment length in seconds (overrides config)
    #[arg(long)]
    segment_duration: Option<u64>,

    /// Broadcast-end poll interval in seconds (overrides config)
    #[arg(long)]
    check_interval: Option<u64>,

    /// Output base directory (overrides config)
    #[arg(short, long)]
    output: Option<String>,

    /// Raw download directory (overrides config)
    #[arg(long)]
    download_dir: Option<String>,

    /// Persist the effective configuration as the new defaults
    #[arg(long)]
    save_config: bool,
}

/// Global shutdown flag
static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Get the global shutdown flag.
fn get_shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN_FLAG
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// Request recorder shutdown.
fn request_shutdown() {
    info!("Shutdown requested");
    get_shutdown_flag().store(true, Ordering::SeqCst);
}

/// Check if shutdown has been requested.
fn is_shutdown_requested() -> bool {
    get_shutdown_flag().load(Ordering::SeqCst)
}

fn main() {
    let cli = Cli::parse();

    let _log_guard = init_logging();
    info!("Livecap recorder starting (pid: {})...", std::process::id());

    setup_signal_handlers();

    match video::ensure_ffmpeg() {
        Ok(()) => info!("FFmpeg available"),
        Err(e) => warn!(
            "FFmpeg check failed: {} (segment conversions may fail)",
            e
        ),
    }

    let mut app_config = config::load_config();
    if let Some(secs) = cli.segment_duration {
        app_config.recording.segment_duration_secs = secs;
    }
    if let Some(secs) = cli.check_interval {
        app_config.monitor.check_interval_secs = secs;
    }
    if let Some(dir) = &cli.output {
        app_config.output.directory = Some(dir.clone());
    }
    if let Some(dir) = &cli.download_dir {
        app_config.recording.download_directory = Some(dir.clone());
    }
    if cli.save_config {
        if let Err(e) = config::save_config(&app_config) {
            warn!("Failed to save config: {}", e);
        }
    }

    let tag = match BroadcastTag::parse(&cli.tag) {
        Ok(tag) => tag,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };
    info!(
        "Broadcast: {} ({:?} by {})",
        tag.broadcast_id, tag.title, tag.broadcaster_name
    );

    let session = match RecordingSession::new(&app_config, tag, &cli.url) {
        Ok(session) => session,
        Err(e) => {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let start_time = match session.start() {
        Ok(start_time) => start_time,
        Err(e) => {
            error!("Failed to start recording: {}", e);
            session.cleanup();
            std::process::exit(1);
        }
    };
    info!(
        "Segment recording started at {} (segment length: {}s)",
        start_time, app_config.recording.segment_duration_secs
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");
    runtime.block_on(wait_for_end(&session));

    // Stop, drain, and merge synchronously after the wait loop exits
    let merged = session.finalize();
    session.cleanup();

    if merged {
        info!(
            "Livecap recorder finished: {}",
            session.tag().broadcast_id
        );
    } else {
        error!("Livecap recorder finished without a merged video");
        std::process::exit(1);
    }
}

/// Sleep-poll until the broadcast ends, the segment manager goes
/// inactive, or a shutdown is requested.
async fn wait_for_end(session: &RecordingSession) {
    loop {
        if is_shutdown_requested() {
            info!("Stop requested, ending recording");
            break;
        }
        if session.broadcast_ended() {
            info!("Broadcast end detected, ending recording");
            break;
        }
        if !session.segment_active() {
            warn!("Segment recording became inactive, ending recording");
            break;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize logging: stderr plus a daily-rolling file in the platform
/// log directory. Returns the appender guard that must stay alive for
/// the process lifetime.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match livecap_common::logging::ensure_log_dir() {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(
                livecap_common::logging::log_dir(),
                livecap_common::logging::LOG_FILE_PREFIX,
            );
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(file_writer))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            warn!("Log directory unavailable, logging to stderr only: {}", e);
            None
        }
    }
}

/// Set up signal handlers for graceful shutdown.
fn setup_signal_handlers() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        std::thread::spawn(|| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let mut sigterm = signal(SignalKind::terminate()).unwrap();
                let mut sigint = signal(SignalKind::interrupt()).unwrap();
                let mut sighup = signal(SignalKind::hangup()).unwrap();

                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                    }
                    _ = sighup.recv() => {
                        info!("Received SIGHUP");
                    }
                }

                request_shutdown();
            });
        });
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(|| {
            info!("Received Ctrl+C");
            request_shutdown();
        })
        .expect("Error setting Ctrl+C handler");
    }
}

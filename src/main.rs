//! beammon - live camera monitor with four-point perspective rectification
//!
//! Frames are polled from a V4L2 camera (or a synthetic one) on a fixed tick.
//! The operator clicks four corners of a target in the raw view; every frame
//! is then rectified to a fixed-size view. Snapshots, gain changes and raw
//! video recording are driven from the browser UI.

mod camera_controls;
mod capture;
mod config;
mod display;
mod emulated;
mod points;
mod recording;
mod runner;
mod server;
mod session;
mod transform;

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tokio::task::JoinError;
use tracing_subscriber::EnvFilter;

use crate::capture::{Camera, V4lCamera};
use crate::display::PreviewStore;
use crate::emulated::SyntheticCamera;
use crate::recording::Y4mSink;
use crate::runner::{command_channel, EventLoop};
use crate::session::Event;

/// beammon - camera monitor with perspective rectification
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Input video device (e.g., /dev/video0), overrides the config file
    #[arg(short, long)]
    device: Option<String>,

    /// Use the synthetic camera instead of a V4L2 device
    #[arg(long)]
    emulate: bool,

    /// Web server port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("beammon v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration, then apply CLI overrides
    let mut config = config::Config::load_or_create(&args.config)?;
    if let Some(device) = args.device {
        config.video.device = device;
    }
    if args.emulate {
        config.video.emulate = true;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let camera: Box<dyn Camera> = if config.video.emulate {
        info!(
            "Using synthetic camera {}x{}",
            config.video.width, config.video.height
        );
        Box::new(SyntheticCamera::new(config.video.width, config.video.height))
    } else {
        info!("Input device: {}", config.video.device);
        let camera = V4lCamera::open(&config.video)?;
        let (width, height) = camera.resolution();
        info!("Resolution: {}x{} @ {}fps", width, height, config.video.fps);
        Box::new(camera)
    };

    let previews = Arc::new(PreviewStore::new(config.display.jpeg_quality));
    let (handle, commands) = command_channel();

    // Start the event loop on its own thread
    let loop_config = config.clone();
    let display = previews.clone();
    let event_loop_handle = tokio::task::spawn_blocking(move || {
        EventLoop::new(
            &loop_config,
            camera,
            Box::new(display),
            Box::new(Y4mSink::new()),
            commands,
        )
        .run()
    });

    // Start the web server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting web server at http://{}", addr);

    let state = Arc::new(server::AppState::new(handle.clone(), previews));
    let server_handle = tokio::spawn(async move { server::run_server(&addr, state).await });

    // Ctrl-C closes any open recording before exit
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            handle.notify(Event::Shutdown);
        }
    });

    // Wait for either to finish (or error)
    let outcome = tokio::select! {
        result = event_loop_handle => settle("Event loop", result),
        result = server_handle => settle("Server", result),
    };

    // the runtime waits for the blocking event loop thread on exit
    shutdown.notify(Event::Shutdown);

    outcome
}

/// Log how a task ended and pass its error on, so failures exit non-zero
fn settle(task: &str, joined: Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => {
            info!("{} exited normally", task);
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("{} error: {:#}", task, e);
            Err(e.context(format!("{} failed", task)))
        }
        Err(e) => {
            tracing::error!("{} task panicked: {}", task, e);
            Err(anyhow!("{} task panicked: {}", task, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_passes_task_errors_on() {
        assert!(settle("Event loop", Ok(Ok(()))).is_ok());

        let err = settle("Event loop", Ok(Err(anyhow!("camera disconnected: unplugged"))))
            .unwrap_err();
        assert_eq!(err.to_string(), "Event loop failed");
        assert!(format!("{:#}", err).contains("unplugged"));
    }

    #[tokio::test]
    async fn test_settle_reports_panicked_task() {
        let joined = tokio::spawn(async {
            if true {
                panic!("boom");
            }
        })
        .await;
        let err = settle("Server", joined.map(|()| Ok(()))).unwrap_err();
        assert!(err.to_string().starts_with("Server task panicked"));
    }
}

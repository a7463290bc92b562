mod api;
mod commands;
mod config;
mod downloader;
mod errors;
mod metadata;
mod output;
mod processing;
mod search;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use crate::api::EventSink;
use crate::commands::{AppState, CommandDispatcher};
use crate::output::OutputMode;

#[derive(Debug, Parser)]
#[command(name = "media-bridge", version, about = "Reads JSON commands on stdin and writes JSON events on stdout")]
struct Cli {
    /// Configuration file (defaults to <config dir>/media-bridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print timestamped event summaries instead of raw JSON
    #[arg(long)]
    debug: bool,

    /// yt-dlp executable
    #[arg(long = "yt-dlp")]
    ytdlp: Option<String>,

    /// ffmpeg binary or the directory containing it
    #[arg(long)]
    ffmpeg_location: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("Starting media-bridge {}", env!("CARGO_PKG_VERSION"));

    let mut config = config::AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(path) = cli.ytdlp {
        config.ytdlp_path = path;
    }
    if let Some(location) = cli.ffmpeg_location {
        config.ffmpeg_location = Some(location);
    }

    if let Some(path) = utils::extended_path(&config.path_additions()) {
        info!("Extending PATH with {:?}", config.path_additions());
        std::env::set_var("PATH", path);
    }

    let mode = if cli.debug { OutputMode::Debug } else { OutputMode::Json };
    let (events, rx) = EventSink::channel();
    let writer = output::spawn_writer(rx, mode, tokio::io::stdout());

    let state = AppState::from_config(config, events).context("initialising bridge")?;
    let dispatcher = CommandDispatcher::new(Arc::new(state));
    let result = dispatcher.run(tokio::io::BufReader::new(tokio::io::stdin())).await;

    // Dropping the last sink lets the writer drain and stop.
    drop(dispatcher);
    if let Err(e) = writer.await {
        log::error!("Event writer task failed: {}", e);
    }

    result.context("reading commands")?;
    info!("media-bridge stopped");
    Ok(())
}

//! # stream_cli
//!
//! A terminal subscriber for the tweet stream hub. Connects, optionally adds
//! tracks and starts the stream, then prints every status update and every
//! tweet embed until interrupted or until the session gives up reconnecting.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};

use lib_stream::loggers::{self, LoggerOptions};
use lib_stream::{ClientOptions, ConnectionState, StreamHubClient, Transport};

/// CLI arguments for stream_cli.
#[derive(Parser, Debug)]
#[clap(
    name = "stream_cli",
    version,
    author = "ckir",
    about = "Subscribes to a tweet stream hub and prints what it broadcasts."
)]
pub struct Cli {
    /// Hub base URL.
    #[clap(long, env = "STREAM_HUB_URL", default_value = "http://localhost:5000")]
    pub url: String,

    /// Transport: websockets, longpolling or auto.
    #[clap(long, default_value = "auto")]
    pub transport: Transport,

    /// Track to add once connected. Repeatable.
    #[clap(long = "track", short = 't', value_name = "TRACK", action = ArgAction::Append)]
    pub tracks: Vec<String>,

    /// Do not start the stream, only listen.
    #[clap(long, action = ArgAction::SetTrue)]
    pub no_start: bool,

    /// Reconnection attempts before giving up. 0 retries forever.
    #[clap(long, default_value_t = 10)]
    pub max_attempts: u32,

    /// Print the raw embed HTML instead of a one-line summary.
    #[clap(long, action = ArgAction::SetTrue)]
    pub html: bool,

    /// Also write JSON logs to this directory.
    #[clap(long)]
    pub log_dir: Option<PathBuf>,

    /// Log filter for the console.
    #[clap(long, env = "STREAM_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = LoggerOptions::new("stream_cli");
    logger.log_dir = cli.log_dir.clone();
    logger.level = cli.log_level.clone();
    let _guard = loggers::init(&logger).context("Failed to initialise logging")?;

    let mut options = ClientOptions::new(cli.url.clone());
    options.transport = cli.transport;
    options.reconnect.max_attempts = (cli.max_attempts > 0).then_some(cli.max_attempts);

    let client = StreamHubClient::connect(options).context("Invalid hub URL")?;

    let html = cli.html;
    client.on_tweet_received(move |embed| async move {
        let topic = if embed.is_off_topic { " (off topic)" } else { "" };
        if html {
            println!("{}", embed.html);
        } else {
            println!("[tweet] {}{} {}", embed.author_name, topic, embed.url);
        }
    });
    client.on_status_updated(|status| async move {
        let flag = if status.is_streaming { "streaming" } else { "idle" };
        println!("[status:{}] {}", flag, status.message);
    });

    tokio::select! {
        outcome = drive(&client, &cli) => {
            if let Err(e) = outcome {
                client.close().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            client.close().await;
            return Ok(());
        }
    }

    let mut states = client.state_changes();
    let terminal = tokio::select! {
        state = states.wait_for(ConnectionState::is_terminal) => state.map(|s| s.clone()).ok(),
        _ = tokio::signal::ctrl_c() => None,
    };
    client.close().await;

    match terminal {
        Some(ConnectionState::GaveUp { reason }) => bail!("Hub unreachable: {}", reason),
        _ => Ok(()),
    }
}

/// Issues the requested invocations once the session is live.
async fn drive(client: &StreamHubClient, cli: &Cli) -> Result<()> {
    if !cli.tracks.is_empty() {
        client
            .add_tracks(&cli.tracks)
            .await
            .context("AddTracks failed")?;
        tracing::info!(tracks = ?cli.tracks, "Tracks added");
    }
    if !cli.no_start {
        // A hub without tracks refuses to start.
        client.start().await.context("StartTweetStream failed")?;
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rehearsal_sync::catalog::{DirCatalog, SongCatalog};
use rehearsal_sync::config::{ClientConfig, ClientOverrides};
use rehearsal_sync::event::ReceivedEvent;
use rehearsal_sync::net::connection::{Connection, ConnectionError};
use rehearsal_sync::net::reliable::ReliableEmitter;
use rehearsal_sync::net::reply::Reply;
use rehearsal_sync::position::PositionState;
use rehearsal_sync::position::follower::Follower;
use rehearsal_sync::position::leader::{Leader, LeaderCommand};
use rehearsal_sync::position::reconcile::FileSongStore;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound frames still queued when the leader ends get this long to flush.
const FLUSH_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub returned HTTP {0}")]
    Status(u16),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Parser, Debug)]
#[command(name = "rehearsal-cli", about = "Lead or follow a rehearsal session")]
struct Cli {
    /// Hub WebSocket endpoint.
    #[arg(long, env = "REHEARSAL_HUB_URL")]
    hub_url: Option<String>,

    /// Hub HTTP base for `ping` and `status`.
    #[arg(long, env = "REHEARSAL_BASE_URL", default_value = "http://127.0.0.1:5000")]
    base_url: String,

    #[arg(long, env = "REHEARSAL_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "REHEARSAL_SESSION")]
    session: Option<String>,

    /// Directory of `<song_id>.json` files.
    #[arg(long, env = "REHEARSAL_SONGS_DIR")]
    songs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read navigation commands from stdin and broadcast them.
    Lead,
    /// Print the session position as it changes.
    Follow,
    /// Check that the hub is up.
    Ping,
    /// Dump the hub's live sessions.
    Status,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env().with_overrides(ClientOverrides {
        hub_url: cli.hub_url,
        token: cli.token,
        session_id: cli.session,
        songs_dir: cli.songs_dir,
    });
    let catalog: Arc<dyn SongCatalog> = Arc::new(DirCatalog::new(config.songs_dir.clone()));

    match cli.command {
        Command::Lead => run_lead(&config, catalog).await,
        Command::Follow => run_follow(&config, catalog).await,
        Command::Ping => run_ping(&cli.base_url).await,
        Command::Status => run_status(&cli.base_url).await,
    }
}

async fn run_lead(config: &ClientConfig, catalog: Arc<dyn SongCatalog>) -> Result<(), CliError> {
    let mut conn = Connection::connect(config.connection())?;
    let streams = conn.take_streams()?;
    conn.handle().wait_connected().await?;
    info!(session_id = %config.session_id, "leading");

    tokio::spawn(log_replies(streams.replies));
    tokio::spawn(discard_echoes(streams.positions));

    let emitter = ReliableEmitter::new(conn.handle(), config.session_id.clone(), config.hedge_policy());
    let mut leader = Leader::new(emitter, catalog);
    if let Some(path) = &config.song_store {
        leader = leader.with_store(Arc::new(FileSongStore::new(path)));
    }
    tokio::spawn(print_states(leader.subscribe()));

    let (tx, rx) = mpsc::channel(16);
    let run = tokio::spawn(leader.run(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<LeaderCommand>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        let ending = command == LeaderCommand::EndSession;
        if tx.send(command).await.is_err() || ending {
            break;
        }
    }
    drop(tx);

    let state = run.await?;
    tokio::time::sleep(FLUSH_GRACE).await;
    print_json(&serde_json::to_value(state)?)
}

async fn run_follow(config: &ClientConfig, catalog: Arc<dyn SongCatalog>) -> Result<(), CliError> {
    let mut conn = Connection::connect(config.connection())?;
    let streams = conn.take_streams()?;
    conn.handle().wait_connected().await?;
    info!(session_id = %config.session_id, "following");

    tokio::spawn(log_replies(streams.replies));

    let mut follower = Follower::new(catalog).with_dedup_capacity(config.follower_dedup_capacity);
    if let Some(path) = &config.song_store {
        follower = follower.with_store(Arc::new(FileSongStore::new(path)), config.reconcile_interval);
    }
    tokio::spawn(print_states(follower.subscribe()));

    tokio::select! {
        state = follower.run(streams.positions) => print_json(&serde_json::to_value(state)?),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

async fn run_ping(base_url: &str) -> Result<(), CliError> {
    let url = format!("{}/healthz", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Status(status.as_u16()));
    }
    println!("ok");
    Ok(())
}

async fn run_status(base_url: &str) -> Result<(), CliError> {
    let url = format!("{}/api/debug/sessions", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Status(status.as_u16()));
    }
    let json = response.json::<Value>().await?;
    print_json(&json)
}

async fn log_replies(mut replies: mpsc::Receiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        match reply {
            Reply::Ack { event, sync_id, status, recipients } => {
                debug!(%event, ?sync_id, status = status.as_str(), recipients, "ack");
            }
            Reply::Error { event, code, message } => warn!(?event, ?code, %message, "hub error"),
            other => debug!(?other, "reply"),
        }
    }
}

/// The leader is a session member too; its own broadcasts come back.
async fn discard_echoes(mut positions: mpsc::Receiver<ReceivedEvent>) {
    while positions.recv().await.is_some() {}
}

async fn print_states(mut states: watch::Receiver<PositionState>) {
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        match serde_json::to_string(&state) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "state encode failed"),
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

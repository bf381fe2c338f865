pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod switcher;
pub mod utils;

pub use commands::SessionHandle;
pub use config::Config;
pub use error::{Error, Result};
pub use session::{Session, SessionEvent};

use clap::{Parser, Subcommand};
use media::SyntheticMediaSource;
use peer::connection::RtcConnector;
use peer::state::NegotiationState;
use signaling::{websocket, LoopbackRelay};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "roomcall", version, about = "Two-party WebRTC call over a room relay")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Force logging on.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a room over the WebSocket relay with generated media.
    ///
    /// Reads `share`, `stop`, `mute`, `unmute`, `video on|off`, `stats`
    /// and `quit` from stdin.
    Join {
        /// `/room/<id>` or a full URL with that path.
        room: String,

        /// Overrides `signaling.url` from the configuration.
        #[arg(long)]
        signaling_url: Option<String>,

        /// Send the microphone only.
        #[arg(long)]
        audio_only: bool,
    },
    /// Run two participants in-process and wait until both are connected.
    Loopback {
        #[arg(long, default_value = "loopback")]
        room: String,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if cli.verbose {
        config.logging.enabled = true;
    }
    logger::init(&config.logging);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        match cli.command {
            Command::Join {
                room,
                signaling_url,
                audio_only,
            } => join(config, &room, signaling_url, audio_only).await,
            Command::Loopback { room, timeout_secs } => {
                loopback(config, &room, Duration::from_secs(timeout_secs)).await
            }
        }
    })
}

async fn join(
    mut config: Config,
    room: &str,
    signaling_url: Option<String>,
    audio_only: bool,
) -> Result<()> {
    if let Some(url) = signaling_url {
        config.signaling.url = url;
    }
    let room_id = utils::room_id_from_path(room, &config.signaling.room_path_prefix)?;
    let url = utils::signaling_url(
        &config.signaling.url,
        &config.signaling.room_param,
        &room_id,
    );

    let (outbound, inbound) = websocket::connect(&url).await?.split();
    let connector = Arc::new(RtcConnector::new(config.ice_servers.clone()));
    let mut media = SyntheticMediaSource::new().with_samples();
    if audio_only {
        media = media.audio_only();
    }
    let (mut session, events) = Session::new(&config, connector, Arc::new(media), outbound);
    session.start().await?;
    info!(room = %room_id, participant = %session.participant_id(), "joined");

    let handle = session.handle();
    let mut session_task = tokio::spawn(session.run(inbound));
    tokio::spawn(report_events("local", events));

    tokio::select! {
        finished = &mut session_task => {
            if let Ok(stats) = finished {
                info!(?stats, "session ended");
            }
        }
        result = control_loop(handle) => {
            session_task.abort();
            result?;
        }
    }
    Ok(())
}

async fn control_loop(handle: SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        let result = match words.as_slice() {
            ["share"] => handle.toggle_screen_share(true).await,
            ["stop"] => handle.toggle_screen_share(false).await,
            ["mute"] => handle.set_audio_enabled(false).await,
            ["unmute"] => handle.set_audio_enabled(true).await,
            ["video", "on"] => handle.set_video_enabled(true).await,
            ["video", "off"] => handle.set_video_enabled(false).await,
            ["stats"] => handle.stats().await.map(|stats| println!("{stats:#?}")),
            ["quit"] | ["exit"] => break,
            [] => Ok(()),
            _ => {
                println!("commands: share | stop | mute | unmute | video on|off | stats | quit");
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(Error::SessionStopped) => break,
            Err(e) => println!("{e}"),
        }
    }
    Ok(())
}

async fn loopback(config: Config, room: &str, timeout: Duration) -> Result<()> {
    let relay = LoopbackRelay::new();
    let mut sessions = Vec::new();
    let mut watchers = Vec::new();

    for name in ["alice", "bob"] {
        let (outbound, inbound) = relay.join(room).await?.split();
        let connector = Arc::new(RtcConnector::new(config.ice_servers.clone()));
        let media = Arc::new(SyntheticMediaSource::new().with_samples());
        let (mut session, events) = Session::new(&config, connector, media, outbound);
        session.start().await?;
        sessions.push(tokio::spawn(session.run(inbound)));
        watchers.push(tokio::spawn(wait_until_stable(name, events)));
        // Second participant arrives after the first one is settled in the room.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let outcome = tokio::time::timeout(timeout, futures_util::future::join_all(watchers)).await;
    for session in &sessions {
        session.abort();
    }
    match outcome {
        Ok(results) if results.iter().all(|r| matches!(r, Ok(true))) => {
            info!(room, "both participants reached stable");
            Ok(())
        }
        Ok(_) => Err(Error::Transport("a participant stopped before connecting".into())),
        Err(_) => Err(Error::Transport(format!(
            "participants not connected after {}s",
            timeout.as_secs()
        ))),
    }
}

async fn wait_until_stable(name: &'static str, mut events: mpsc::Receiver<SessionEvent>) -> bool {
    while let Some(event) = events.recv().await {
        log_event(name, &event);
        if matches!(event, SessionEvent::StateChanged(NegotiationState::Stable)) {
            tokio::spawn(report_events(name, events));
            return true;
        }
    }
    false
}

async fn report_events(name: &'static str, mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        log_event(name, &event);
    }
}

fn log_event(name: &str, event: &SessionEvent) {
    match event {
        SessionEvent::NegotiationFailed { stage, error } => {
            warn!(participant = name, %stage, %error, "negotiation failed")
        }
        SessionEvent::CandidateDropped { reason } => {
            info!(participant = name, %reason, "remote candidate dropped")
        }
        SessionEvent::RemoteStreamAvailable(stream) => {
            info!(participant = name, stream = %stream.id, tracks = stream.tracks.len(), "remote media available")
        }
        SessionEvent::StateChanged(state) => info!(participant = name, %state, "negotiation state"),
        other => info!(participant = name, event = ?other, "session event"),
    }
}

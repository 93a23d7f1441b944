use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use wave_core::config::EngineConfig;
use wave_core::engine::{EngineEvent, NegotiationEngine};
use wave_core::handle::rtc::RtcHandleFactory;
use wave_core::media::StaticCapture;
use wave_core::signaling::WebSocketSignaling;
use wave_core::telemetry::{self, LogConfig, LogLevel};
use wave_proto::PeerId;

#[derive(Parser, Debug)]
#[command(name = "wave")]
#[command(about = "Join a wave room and negotiate a WebRTC call with whoever is in it")]
struct Cli {
    /// Relay url (http, https, ws or wss)
    #[arg(long, env = "WAVE_RELAY_URL", default_value = "http://127.0.0.1:8080")]
    relay: String,

    /// Room to join
    #[arg(long, env = "WAVE_ROOM", default_value = "42")]
    room: String,

    /// Peer id announced to the relay; generated when omitted
    #[arg(long, env = "WAVE_PEER_ID")]
    peer_id: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Skip STUN and gather host candidates only
    #[arg(long)]
    no_stun: bool,

    /// Do not attach camera and microphone tracks
    #[arg(long)]
    no_media: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("initialise logging")?;

    let mut config = EngineConfig::from_env();
    if cli.no_stun {
        config.ice_servers.clear();
    }
    let capture = if cli.no_media {
        StaticCapture::empty()
    } else {
        StaticCapture::camera_and_microphone()
    };

    let peer = cli.peer_id.map(PeerId::from).unwrap_or_else(PeerId::generate);
    let transport = WebSocketSignaling::connect(&cli.relay, peer.clone())
        .await
        .with_context(|| format!("connect to relay {}", cli.relay))?;
    let factory = RtcHandleFactory::new().context("build webrtc api")?;

    let engine = NegotiationEngine::spawn(
        Arc::new(transport),
        Arc::new(factory),
        Arc::new(capture),
        config,
    );
    let mut events = engine
        .take_events()
        .context("engine event stream already taken")?;
    engine.join_room(&cli.room).await?;
    eprintln!("wave: {peer} joined room {}", cli.room);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    engine.shutdown().await;
    Ok(())
}

fn report(event: &EngineEvent) {
    match event {
        EngineEvent::PeerJoined { peer, politeness } => {
            eprintln!("wave: paired with {peer} ({politeness:?})");
        }
        EngineEvent::RemoteTrackAvailable { peer, track } => {
            eprintln!("wave: {peer} sent {} track {}", track.kind, track.id);
        }
        EngineEvent::ConnectionStateChanged { peer, state } => {
            eprintln!("wave: connection to {peer} is {state}");
        }
        EngineEvent::NegotiationFailed {
            peer,
            stage,
            reason,
        } => {
            eprintln!("wave: negotiation with {peer} failed to {stage}: {reason}");
        }
        EngineEvent::MediaAcquisitionFailed { peer, error } => {
            eprintln!("wave: no local media for {peer}: {error}");
        }
        EngineEvent::SessionClosed { peer, reason } => {
            eprintln!("wave: session with {peer} closed ({reason})");
        }
        EngineEvent::RelayRejected { reason } => {
            eprintln!("wave: relay rejected a message: {reason}");
        }
    }
}

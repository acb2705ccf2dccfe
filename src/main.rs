//! Loopback call: an initiator and a joiner in one process, negotiating
//! through a shared signaling store.

use clap::Parser;
use parley_lib::config::SessionConfig;
use parley_lib::logger::{self, LogConfig, LogLevel};
use parley_lib::peer::fake::FakeBackendFactory;
use parley_lib::peer::{BackendFactory, WebRtcBackendFactory};
use parley_lib::{signal_bus, ConnectionLifecycleController, DisconnectReason, ParleyError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley-loopback", about = "Negotiate a call between two local peers")]
struct Cli {
    /// Use the scripted in-process negotiation object instead of webrtc.
    #[arg(long)]
    fake: bool,

    /// Seconds to wait for the connection before giving up.
    #[arg(long, env = "PARLEY_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Seconds to stay connected before hanging up.
    #[arg(long, default_value_t = 2)]
    hold_secs: u64,

    /// HTTP signaling store; process-local when omitted.
    #[arg(long, env = "PARLEY_SIGNAL_URL")]
    signal_url: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Debug)]
enum PeerEvent {
    Connected(&'static str),
    Disconnected(&'static str, DisconnectReason),
}

fn callbacks(
    name: &'static str,
    events: &mpsc::UnboundedSender<PeerEvent>,
) -> (
    impl FnOnce() + Send + 'static,
    impl FnOnce(DisconnectReason) + Send + 'static,
) {
    let connected = events.clone();
    let disconnected = events.clone();
    (
        move || {
            let _ = connected.send(PeerEvent::Connected(name));
        },
        move |reason| {
            let _ = disconnected.send(PeerEvent::Disconnected(name, reason));
        },
    )
}

#[tokio::main]
async fn main() -> Result<(), ParleyError> {
    let cli = Cli::parse();
    if let Err(err) = logger::init(&LogConfig {
        level: cli.log_level,
        ansi: true,
    }) {
        eprintln!("{err}");
    }

    let mut config = SessionConfig::from_env();
    config.set_connect_timeout_secs(cli.timeout_secs);
    config.signal_url = cli.signal_url;
    config.validate()?;

    let bus = signal_bus(&config)?;
    let factory: Arc<dyn BackendFactory> = if cli.fake {
        Arc::new(FakeBackendFactory::new())
    } else {
        Arc::new(WebRtcBackendFactory)
    };

    let mut initiator =
        ConnectionLifecycleController::new(config.clone(), bus.clone(), factory.clone());
    let mut joiner = ConnectionLifecycleController::new(config, bus, factory);

    let (tx, mut events) = mpsc::unbounded_channel();

    let room = initiator.create_session()?;
    info!(room = %room, "room created");
    let (on_connected, on_disconnected) = callbacks("initiator", &tx);
    initiator.initialize(on_connected, on_disconnected).await?;
    initiator.call().await?;

    joiner.join_session(&room)?;
    let (on_connected, on_disconnected) = callbacks("joiner", &tx);
    joiner.initialize(on_connected, on_disconnected).await?;
    drop(tx);

    let mut connected = 0;
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Connected(name) => {
                info!(peer = name, "peer connected");
                connected += 1;
                if connected == 2 {
                    break;
                }
            }
            PeerEvent::Disconnected(name, reason) => {
                warn!(peer = name, ?reason, "peer gave up");
                break;
            }
        }
    }

    if connected == 2 {
        tokio::time::sleep(Duration::from_secs(cli.hold_secs)).await;
    }
    initiator.hang_up().await;
    // Give the joiner a couple of poll intervals to see the farewell.
    tokio::time::sleep(Duration::from_secs(2)).await;
    joiner.hang_up().await;

    while let Some(event) = events.recv().await {
        if let PeerEvent::Disconnected(name, reason) = event {
            info!(peer = name, ?reason, "peer disconnected");
        }
    }
    println!("loopback finished: {connected}/2 peers connected");
    Ok(())
}

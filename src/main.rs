use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peermesh::{
    DeviceCapture, MediaCapture, MeshConfig, MeshCoordinator, NullCapture, SignalingClient,
    WebRtcFactory,
};

/// Headless mesh client: joins a room and logs participants as they come
/// and go. Rendering is left to the embedding application.
#[derive(Parser, Debug)]
#[command(name = "peermesh", version)]
struct Args {
    /// Room to join
    #[arg(long)]
    room: String,

    /// Signaling server URL
    #[arg(long, env = "PEERMESH_SIGNALING_URL", default_value = "ws://127.0.0.1:8080")]
    signaling: String,

    /// Fixed peer id (random when omitted)
    #[arg(long)]
    peer_id: Option<String>,

    /// STUN server, repeatable
    #[arg(long = "stun", default_value = "stun:stun.l.google.com:19302")]
    stun_servers: Vec<String>,

    /// Skip microphone capture (tracks stay silent unless fed externally)
    #[arg(long)]
    no_audio: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = MeshConfig {
        signaling_url: args.signaling,
        stun_servers: args.stun_servers,
        peer_id: args.peer_id,
    };

    let signaling = SignalingClient::connect(&config.signaling_url).await?;
    info!("connected to signaling server at {}", config.signaling_url);

    let capture: Arc<dyn MediaCapture> = if args.no_audio {
        Arc::new(NullCapture)
    } else {
        Arc::new(DeviceCapture)
    };
    let factory = Arc::new(WebRtcFactory::new(config.stun_servers.clone()));

    let mut coordinator = MeshCoordinator::new(signaling, capture, factory, &config);
    coordinator.start(&args.room).await?;

    let (room, task) = coordinator.spawn();

    let mut remotes = room.remote_peers();
    tokio::spawn(async move {
        while remotes.changed().await.is_ok() {
            let ids: Vec<String> = remotes
                .borrow_and_update()
                .iter()
                .map(|p| p.peer_id.clone())
                .collect();
            info!("participants: [{}]", ids.join(", "));
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("leaving room");
    room.stop().await?;

    if let Err(e) = task.await? {
        warn!("session ended with error: {}", e);
    }
    Ok(())
}

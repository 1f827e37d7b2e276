use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::LocalStream;

/// Inbound media from one remote participant.
pub type RemoteStream = Arc<TrackRemote>;

/// Notifications a peer connection pushes back into the coordinator loop.
/// Connection callbacks never mutate coordinator state directly.
#[derive(Clone)]
pub enum PeerEvent {
    /// The connection started producing an inbound media stream.
    Track { peer_id: String, stream: RemoteStream },
    /// The connection failed; the coordinator drops this peer.
    Failed { peer_id: String },
}

/// One negotiated (or in-negotiation) connection to a single participant.
///
/// Negotiation payloads are opaque JSON-encoded session descriptions; the
/// coordinator only moves them between this handle and the signaling
/// channel.
#[async_trait]
pub trait MeshPeer: Send + Sync {
    /// Produces the local offer payload, candidates included.
    async fn create_offer(&self) -> Result<String>;
    /// Applies a remote offer and produces the answering payload.
    async fn accept_offer(&self, sdp: &str) -> Result<String>;
    /// Applies the remote answer, completing negotiation.
    async fn accept_answer(&self, sdp: &str) -> Result<()>;
    /// Releases the connection. Safe to call once per peer.
    async fn close(&self) -> Result<()>;
}

/// Opens connections bound to the shared local stream.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn open(
        &self,
        peer_id: &str,
        local: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn MeshPeer>>;
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MeshPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        // No trickle message in the protocol, so gather before sending.
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        let _ = gathered.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Peer("local description unavailable after gathering".to_string()))?;
        Ok(serde_json::to_string(&local)?)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = serde_json::from_str(sdp)?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;
        let _ = gathered.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Peer("local description unavailable after gathering".to_string()))?;
        Ok(serde_json::to_string(&local)?)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = serde_json::from_str(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Builds webrtc-rs peer connections with the shared tracks attached.
pub struct WebRtcFactory {
    stun_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn open(
        &self,
        peer_id: &str,
        local: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn MeshPeer>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::Peer(format!("interceptor setup failed: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        pc.add_track(local.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        pc.add_track(local.video_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let track_events = events.clone();
        let track_peer = peer_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let peer_id = track_peer.clone();
            Box::pin(async move {
                debug!("inbound {} track from {}", track.kind(), peer_id);
                let _ = events
                    .send(PeerEvent::Track {
                        peer_id,
                        stream: track,
                    })
                    .await;
            })
        }));

        let state_peer = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let peer_id = state_peer.clone();
            Box::pin(async move {
                debug!("peer {} connection state: {}", peer_id, state);
                if state == RTCPeerConnectionState::Failed {
                    let _ = events.send(PeerEvent::Failed { peer_id }).await;
                }
            })
        }));

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

//! Room-based WebRTC peer mesh coordinator.
//!
//! Joining a named room on a signaling server, the coordinator discovers the
//! existing members, negotiates one direct media connection per member, and
//! exposes the resulting remote streams alongside the shared local stream.
//! Members that join later send us an offer; members that leave are released.
//!
//! ```text
//! Signaling server (WebSocket, JSON)
//!   ↓ join / roster / offer / answer / peer-left
//! MeshCoordinator (actor task)
//!   ├─ SignalingClient   out-of-band negotiation transport
//!   ├─ LocalStream       shared audio+video tracks (cpal capture)
//!   └─ PeerLink per participant (webrtc-rs connection)
//!       ↓
//! RoomHandle — commands + watch channel of remote streams
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use peermesh::{DeviceCapture, MeshConfig, MeshCoordinator, SignalingClient, WebRtcFactory};
//!
//! let config = MeshConfig::default();
//! let signaling = SignalingClient::connect(&config.signaling_url).await?;
//! let factory = Arc::new(WebRtcFactory::new(config.stun_servers.clone()));
//! let mut coordinator = MeshCoordinator::new(signaling, Arc::new(DeviceCapture), factory, &config);
//!
//! coordinator.start("book-club-42").await?;
//! let (room, task) = coordinator.spawn();
//! // render room.remote_peers(), then:
//! room.stop().await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod peer;
pub mod signaling;

pub use config::MeshConfig;
pub use coordinator::{MeshCoordinator, MeshState, RemotePeer, RoomHandle};
pub use error::{Error, Result};
pub use media::{DeviceCapture, LocalStream, MediaCapture, NullCapture};
pub use peer::{MeshPeer, PeerEvent, PeerFactory, RemoteStream, WebRtcFactory};
pub use signaling::{SignalingClient, SignalingMessage};

use serde::{Deserialize, Serialize};

/// Configuration for a mesh session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// WebSocket URL of the signaling server.
    pub signaling_url: String,
    /// STUN servers handed to every peer connection.
    pub stun_servers: Vec<String>,
    /// Fixed local peer id; generated when `None`.
    pub peer_id: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            peer_id: None,
        }
    }
}

impl MeshConfig {
    /// Resolves the local peer id, generating a random one when not configured.
    pub fn local_peer_id(&self) -> String {
        self.peer_id
            .clone()
            .unwrap_or_else(|| format!("user-{}", rand::random::<u32>()))
    }
}

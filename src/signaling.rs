use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Room-scoped signaling protocol.
///
/// `Join` announces presence; the server responds with a `Roster` of peers
/// already in the room. Negotiation payloads travel out-of-band in
/// `Offer`/`Answer`, addressed to a single peer. `PeerLeft` is broadcast
/// when a participant disconnects. Media never crosses this channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum SignalingMessage {
    Join {
        room_id: String,
        peer_id: String,
    },
    Roster {
        peers: Vec<String>,
    },
    Offer {
        room_id: String,
        sdp: String,
        from_peer: String,
        to_peer: String,
    },
    Answer {
        room_id: String,
        sdp: String,
        from_peer: String,
        to_peer: String,
    },
    PeerLeft {
        peer_id: String,
    },
}

/// Bidirectional signaling channel.
///
/// The WebSocket transport is pumped by two background tasks; the client
/// itself is just a pair of bounded queues, so alternative transports (and
/// tests) can build one from raw channel halves via [`from_parts`].
///
/// [`from_parts`]: SignalingClient::from_parts
pub struct SignalingClient {
    tx: mpsc::Sender<SignalingMessage>,
    rx: mpsc::Receiver<SignalingMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<SignalingMessage>(100);

        // Outgoing pump: JSON-encode and push onto the socket.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(json.into()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("failed to encode signaling message: {}", e),
                }
            }
        });

        // Incoming pump: undecodable frames (pings, unknown tags) are dropped.
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                if let Ok(msg) = msg {
                    match serde_json::from_str::<SignalingMessage>(msg.to_string().as_str()) {
                        Ok(signal) => {
                            if inbound_tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("dropping unrecognized signaling frame: {}", e),
                    }
                }
            }
        });

        Ok(Self {
            tx: outgoing_tx,
            rx: inbound_rx,
        })
    }

    /// Builds a client directly from channel halves, bypassing the WebSocket
    /// transport.
    pub fn from_parts(
        tx: mpsc::Sender<SignalingMessage>,
        rx: mpsc::Receiver<SignalingMessage>,
    ) -> Self {
        Self { tx, rx }
    }

    pub async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|e| Error::Signaling(format!("failed to send message: {}", e)))
    }

    /// Receives the next inbound message; `None` once the transport closes.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }
}

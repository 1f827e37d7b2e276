use std::fmt;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Errors surfaced by the mesh coordinator and its collaborators.
///
/// `Media` is fatal for the session: without a local stream there is
/// nothing to negotiate. `Peer` errors are scoped to a single remote
/// participant and never tear down the room.
#[derive(Debug)]
pub enum Error {
    /// Local capture device unavailable or unusable.
    Media(String),
    /// Signaling transport failed or was closed.
    Signaling(String),
    /// A single peer connection failed to negotiate or operate.
    Peer(String),
    /// An operation was invoked in a state that does not permit it.
    State(String),
    WebRTC(WebRTCError),
    Ws(WsError),
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Media(msg) => write!(f, "media error: {}", msg),
            Error::Signaling(msg) => write!(f, "signaling error: {}", msg),
            Error::Peer(msg) => write!(f, "peer error: {}", msg),
            Error::State(msg) => write!(f, "invalid state: {}", msg),
            Error::WebRTC(e) => write!(f, "WebRTC error: {}", e),
            Error::Ws(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<WebRTCError> for Error {
    fn from(err: WebRTCError) -> Self {
        Error::WebRTC(err)
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Error::Ws(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

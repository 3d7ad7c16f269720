//! Session handle given to realtime (WebSocket) user functions.

use bytes::Bytes;
use tokio::sync::mpsc;

/// A message exchanged over a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Text(String),
    Binary(Bytes),
}

/// Handle to one open realtime session.
///
/// The host owns the underlying socket; liveness pings and pongs never reach
/// this handle.
#[derive(Debug)]
pub struct Session {
    id: u64,
    inbound: mpsc::UnboundedReceiver<SessionMessage>,
    outbound: mpsc::UnboundedSender<SessionMessage>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        inbound: mpsc::UnboundedReceiver<SessionMessage>,
        outbound: mpsc::UnboundedSender<SessionMessage>,
    ) -> Self {
        Self {
            id,
            inbound,
            outbound,
        }
    }

    /// Session id, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message from the peer, or `None` once the session has closed.
    pub async fn recv(&mut self) -> Option<SessionMessage> {
        self.inbound.recv().await
    }

    /// Send a message to the peer. Returns `false` if the session has closed.
    pub fn send(&self, message: SessionMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Send a text message to the peer.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(SessionMessage::Text(text.into()))
    }
}

//! Events published by a connection and the observer callback contract

use std::sync::Arc;

use crate::connection::PeerId;

/// Event published by a connection's receive loop
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Raw bytes received from the peer, exactly as read off the socket.
    /// Framing and parsing are the observer's job.
    IncomingMessage(Vec<u8>),

    /// The connection terminated. The string describes why: either the
    /// peer closed its end or the OS reported a read error. Always the
    /// last event published for a connection.
    Disconnected(String),
}

/// Externally supplied observer, invoked synchronously on the receive task
/// for every event.
///
/// There is no queue between the socket and the callback: a callback that
/// blocks stalls further reads for that connection. It must not panic back
/// into the loop.
pub type EventCallback = Arc<dyn Fn(&PeerId, ConnectionEvent) + Send + Sync>;

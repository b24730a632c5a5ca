//! Hawser Network Library
//!
//! A single connected-socket abstraction: each [`Connection`] owns one
//! accepted TCP stream, runs a background receive loop, and reports
//! incoming data and disconnection to an externally supplied callback.
//!
//! # Architecture
//!
//! - **Connection**: wraps an accepted socket; `start_listen` spawns the
//!   receive loop, `send` and `close` run concurrently with it
//! - **Events**: raw received chunks and a terminal disconnect notice,
//!   delivered synchronously on the receive task
//! - The accept side and any multi-connection registry live outside this
//!   crate; the constructor takes an already-connected stream
//!
//! # Usage
//!
//! ```ignore
//! let (stream, addr) = listener.accept().await?;
//!
//! let callback: EventCallback = Arc::new(|peer, event| match event {
//!     ConnectionEvent::IncomingMessage(bytes) => { /* handle */ }
//!     ConnectionEvent::Disconnected(reason) => { /* handle */ }
//! });
//!
//! let conn = Connection::new(stream, addr.ip(), callback);
//! conn.start_listen()?;
//!
//! conn.send(b"hello").await?;
//! conn.close().await?;
//! ```

pub mod connection;
pub mod error;
pub mod event;

pub use connection::{Connection, ConnectionConfig, PeerId};
pub use error::{Error, Result};
pub use event::{ConnectionEvent, EventCallback};

/// Largest chunk handed to the observer per read
pub const MAX_CHUNK_SIZE: usize = 4096;

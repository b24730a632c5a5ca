//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("send failed: {0}")]
    Transmission(#[source] io::Error),

    #[error("only {sent} bytes out of {requested} were sent to peer")]
    PartialSend { requested: usize, sent: usize },

    #[error("close failed: {0}")]
    Close(#[source] io::Error),

    #[error("already listening")]
    AlreadyListening,
}

//! The failure taxonomy of the engine. Transport level errors are absorbed and
//! counted by the worker that owns the socket, everything else travels up to
//! the caller.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The peer closed the stream, possibly in the middle of a frame.
    #[error("transport closed by peer")]
    TransportClosed,

    /// The underlying stream reported an I/O failure.
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] io::Error),

    /// A complete frame arrived but its payload was not the expected JSON.
    /// The socket stays usable after this.
    #[error("message decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Wrong or missing token during admission.
    #[error("wrong or missing token")]
    AuthRejected,

    /// An operation was invoked in a lifecycle state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The token is already bound to another slot.
    #[error("token already declared: {0}")]
    DuplicateToken(String),

    /// The game logic declared a client whose id does not match its position.
    #[error("client id mismatch: declared {declared}, expected {expected}")]
    IdMismatch { expected: usize, declared: usize },

    /// The configuration file is missing, malformed or carries illegal values.
    /// Fatal at supervisor construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// The output pipeline could not take another message.
    #[error("output queue overflow")]
    QueueOverflow,

    /// A wait ran into its deadline or was cancelled.
    #[error("wait was interrupted")]
    Interrupted,
}

impl EngineError {
    /// Transport level errors never abort the turn loop, they only count
    /// against the owning worker.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EngineError::TransportClosed | EngineError::TransportIo(_) | EngineError::Decode(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

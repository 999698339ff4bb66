//! Domain-specific error types for the mirroring protocol.
//!
//! All fallible operations return `Result<T, MirrorError>`.
//! No panics on invalid input; every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the mirroring protocol.
#[derive(Debug, Error)]
pub enum MirrorError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The byte channel was closed while an operation was pending.
    #[error("channel closed")]
    ChannelClosed,

    /// The I/O layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that could not be parsed as a valid message.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// A one-byte control message tag with no matching variant.
    ///
    /// Tolerable: the reader skips the length-prefixed payload and
    /// continues, so old peers survive protocol additions.
    #[error("unknown control message type: {0}")]
    UnknownMessageType(u8),

    /// A video packet arrived out of sequence. Fatal for the session:
    /// the single-writer frame numbering cannot be silently resumed.
    #[error("frame number gap: expected {expected}, got {actual}")]
    FrameNumberGap { expected: u64, actual: u64 },

    /// The peer violated the protocol in some other way.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Codec Errors ─────────────────────────────────────────────
    /// The video encoder failed to open, configure, or encode.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// The video decoder rejected an inbound payload.
    #[error("decoder error: {0}")]
    Decoder(String),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// An operation was attempted in a session state that does not
    /// permit it (e.g. `start()` on a crashed session).
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl MirrorError {
    /// Returns `true` when the error means the peer went away rather
    /// than misbehaved. Such errors are normal disconnects outside of
    /// the handshake.
    pub fn is_lost_connection(&self) -> bool {
        match self {
            MirrorError::ChannelClosed => true,
            MirrorError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MirrorError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MirrorError::ChannelClosed
    }
}

// ── Disconnect ────────────────────────────────────────────────────

/// The way a session ended, as observed by the client.
///
/// The three cases must stay distinguishable end-to-end: an init
/// failure offers a retry, a crash offers a reconnect, a stop is
/// uneventful.
#[derive(Debug, Error)]
pub enum Disconnect {
    /// An error occurred before the session reached `Running`.
    #[error("initialization failed: {0}")]
    InitFailure(MirrorError),

    /// The session went down after it was running, without a stop
    /// request: unexpected channel closure or abnormal agent exit.
    #[error("session crashed: {0}")]
    Crashed(MirrorError),

    /// Clean, client-initiated shutdown.
    #[error("session stopped")]
    Stopped,
}

//! Stream error types.
//!
//! Every failure in the data plane falls in one of four families:
//! invalid arguments, broken streams, timeouts, and plain I/O errors
//! coming from a wrapped source or sink.  Streams surface these
//! through the `std::io` traits, so each variant maps to a stable
//! [`io::ErrorKind`] and converts losslessly into [`io::Error`].
//!
//! Background copy tasks record their failure in an [`ErrorSlot`]; the
//! foreground owner replays it at every public call.

use std::io;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// Data-plane errors expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A bad parameter detected synchronously (out-of-range index,
    /// oversized write, conflicting stage).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A producer or consumer went away without the completion signal.
    #[error("broken stream: {0}")]
    BrokenStream(String),

    /// No progress within the configured stall window.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Use of a handle after it was closed by its owner.
    #[error("stream closed: {0}")]
    Closed(String),

    /// The digest algorithm name is not recognised.
    #[error("unknown digest algorithm: {0}")]
    UnknownDigest(String),

    /// Error propagated from a wrapped source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// The `io::ErrorKind` this error travels as.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            StreamError::InvalidArgument(_) | StreamError::UnknownDigest(_) => {
                io::ErrorKind::InvalidInput
            }
            StreamError::BrokenStream(_) => io::ErrorKind::BrokenPipe,
            StreamError::Timeout(_) => io::ErrorKind::TimedOut,
            StreamError::Closed(_) => io::ErrorKind::NotConnected,
            StreamError::Io(e) => e.kind(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StreamError::InvalidArgument(msg.into())
    }

    pub fn broken(msg: impl Into<String>) -> Self {
        StreamError::BrokenStream(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        StreamError::Timeout(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        StreamError::Closed(msg.into())
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            other => io::Error::new(other.kind(), other),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// True when `err` reports a producer or consumer that vanished.
pub fn is_broken_stream(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
}

/// True when `err` reports a stall timeout.
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

// -- Single-slot error holder -------------------------------------------------

#[derive(Debug)]
struct Recorded {
    kind: io::ErrorKind,
    message: String,
}

/// First-error-wins holder shared between a background task and the
/// stream object that owns it.
///
/// Cloning yields another handle onto the same slot.  Once an error is
/// recorded it never changes; every later [`check`](Self::check)
/// replays it as a fresh `io::Error` of the same kind and message.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    inner: Arc<OnceLock<Recorded>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` unless another error was recorded first.
    /// Returns `true` when this call won the slot.
    pub fn record(&self, err: &io::Error) -> bool {
        let mut won = false;
        self.inner.get_or_init(|| {
            won = true;
            Recorded {
                kind: err.kind(),
                message: err.to_string(),
            }
        });
        won
    }

    /// Record a crate error; same first-wins rule as [`record`](Self::record).
    pub fn record_stream(&self, err: StreamError) -> bool {
        self.record(&io::Error::from(err))
    }

    pub fn is_set(&self) -> bool {
        self.inner.get().is_some()
    }

    /// Replay the recorded error, if any.
    pub fn error(&self) -> Option<io::Error> {
        self.inner
            .get()
            .map(|r| io::Error::new(r.kind, r.message.clone()))
    }

    /// `Ok(())` while nothing has been recorded.
    pub fn check(&self) -> io::Result<()> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

//! The error and result types used throughout the engine.

use std::fmt;

/// The crate-wide result type, defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the engine and its parts.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer broke the wire protocol: a malformed handshake, invalid
    /// message framing, an out-of-range index, or a bitfield sent after the
    /// availability exchange. The peer is dropped and its address is not
    /// redialed for a back-off window.
    ProtocolViolation(&'static str),
    /// A downloaded piece failed SHA-1 verification. The piece is requeued
    /// and the contributing peer is striked.
    HashMismatch,
    /// A disk read or write failed. This pauses the transfer: peers stay
    /// connected but downloaders block until the transfer is resumed or
    /// stopped.
    Io(std::io::Error),
    /// The socket to the peer was closed or errored. The peer is dropped
    /// cleanly and its request marks are released.
    ConnectionLost,
    /// The remote handshake carried our own peer id, that is, we dialed
    /// ourselves. Closed silently.
    SelfConnection,
    /// The remote handshake advertised a different torrent. Closed silently.
    InfoHashMismatch,
    /// The peer sent nothing within the idle window.
    PeerTimeout,
    /// The stop signal fired while the operation was in flight.
    Cancelled,
    /// A piece index outside the torrent was used.
    InvalidPieceIndex,
    /// The torrent metainfo could not be parsed or is inconsistent.
    InvalidMetainfo,
    /// The engine configuration rules out this connection (e.g. encryption
    /// is forced but not available).
    Unsupported(&'static str),
    /// The tracker announce failed.
    Tracker(String),
    /// An internal channel was closed while the other half still needed it.
    /// This only happens during shutdown.
    Channel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ProtocolViolation(what) => {
                write!(f, "peer protocol violation: {}", what)
            }
            Error::HashMismatch => write!(f, "piece hash mismatch"),
            Error::Io(e) => write!(f, "disk IO error: {}", e),
            Error::ConnectionLost => write!(f, "peer connection lost"),
            Error::SelfConnection => write!(f, "connected to ourselves"),
            Error::InfoHashMismatch => {
                write!(f, "peer handshake info hash mismatch")
            }
            Error::PeerTimeout => write!(f, "peer timed out"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidMetainfo => write!(f, "invalid torrent metainfo"),
            Error::Unsupported(what) => write!(f, "unsupported: {}", what),
            Error::Tracker(e) => write!(f, "tracker error: {}", e),
            Error::Channel => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // a socket level error means the connection is gone; everything else
        // is reported as a disk error by the components that do file IO
        Error::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(_: serde_bencode::Error) -> Self {
        Error::InvalidMetainfo
    }
}

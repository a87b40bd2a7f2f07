//! Crate level errors.
//!
//! Subsystems with richer failure modes (disk IO, trackers) define their own
//! error kinds and convert into [`Error`] at the API boundary. Invariant
//! violations are not represented here: those are programming errors and
//! panic.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the engine's public API and by internal tasks
/// that terminate a connection or a torrent.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The torrent metainfo is not a valid bencoded structure or is missing
    /// required fields.
    #[error("invalid torrent metainfo: {0}")]
    InvalidMetainfo(&'static str),

    /// Holds bencode serialization errors.
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// An IO error ocurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The piece index is invalid for the torrent.
    #[error("invalid piece index")]
    InvalidPieceIndex,

    /// The torrent ID did not correspond to any entry.
    #[error("invalid torrent id")]
    InvalidTorrentId,

    /// An API method was called in a lifecycle state in which it is not
    /// allowed, e.g. mutating the file list of an open torrent.
    #[error("operation not allowed in the current state: {0}")]
    InvalidState(&'static str),

    /// Peer's torrent info hash did not match ours.
    #[error("invalid peer info hash")]
    InvalidPeerInfoHash,

    /// The connection turned out to be to ourselves.
    #[error("connected to self")]
    OwnConnection,

    /// A duplicate connection to the same peer was refused.
    #[error("duplicate peer connection")]
    DuplicatePeerConnection,

    /// The peer violated the wire protocol (oversized frame, invalid request,
    /// bitfield sent mid-session, and the like). Closes the connection.
    #[error("peer protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The peer went silent past the inactivity limit.
    #[error("peer connection timed out")]
    ConnectionTimeout,

    /// Every tracker in every group failed the announce. Holds the last
    /// failure message.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// A per-torrent storage failure (hash mismatch loops, file shrank,
    /// unwritable download directory). Stops the torrent but not the engine.
    #[error("storage error: {0}")]
    Storage(String),

    /// The channel on which some component was listening or sending died.
    #[error("channel error")]
    Channel,
}

// Channel send errors all collapse into `Error::Channel`: the only way a send
// can fail is if the receiving task is gone, at which point the sender is
// shutting down too.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

//! Error types of the disk task.
//!
//! Disk failures are scoped: an allocation error fails only the new torrent,
//! a write error fails (and is reported to) only the torrent whose piece was
//! being flushed, and a read error fails only the block request that needed
//! the data. None of them terminate the disk task itself.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that may occur while allocating a new torrent's files on disk.
#[derive(Debug, Error)]
pub(crate) enum NewTorrentError {
    /// The torrent id is already taken by an allocated torrent.
    #[error("torrent already allocated")]
    AlreadyExists,

    /// A file could not be opened or sized. The path is kept for the
    /// caller's error report.
    #[error("failed to open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    /// Any other IO error, e.g. failing to create the download directory.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that may occur while writing a downloaded piece to disk.
#[derive(Debug, Error)]
pub(crate) enum WriteError {
    /// The block metadata refers to a piece the torrent doesn't have.
    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that may occur while reading a block or piece from disk.
#[derive(Debug, Error)]
pub(crate) enum ReadError {
    /// The block metadata refers to a piece the torrent doesn't have.
    #[error("invalid piece index")]
    InvalidPieceIndex,

    /// A file returned fewer bytes than its declared size implies, i.e. it
    /// was truncated or deleted while the torrent was open.
    #[error("file shorter than expected")]
    ShortRead,

    #[error(transparent)]
    Io(#[from] io::Error),
}

//! The disk task.
//!
//! All file IO and piece hashing happens on a dedicated task, driven by
//! commands from torrents and peer sessions. Block writes are buffered per
//! piece; a completed piece is hashed and, if valid, flushed to its files,
//! and the owning torrent is alerted either way. Block reads for uploads go
//! through a per torrent LRU piece cache and are answered directly on a
//! channel provided by the requesting peer session.
//!
//! The task never dies from per torrent IO errors: those are reported to the
//! torrent, which decides whether to stop.

mod error;
mod io;

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task,
};

pub(crate) use error::*;

use crate::{
    error::Result, storage_info::StorageInfo, torrent, BlockInfo, CachedBlock,
    PieceIndex, TorrentId,
};

/// Spawns the disk task and returns its join handle and a cloneable command
/// handle.
pub(crate) fn spawn() -> Result<(task::JoinHandle<Result<()>>, DiskHandle)> {
    log::info!("Spawning disk IO task");
    let (mut disk, cmd_chan) = io::Disk::new()?;
    let join_handle = task::spawn(async move { disk.start().await });
    log::info!("Spawned disk IO task");

    Ok((join_handle, DiskHandle(cmd_chan)))
}

/// The handle through which the rest of the engine talks to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Instructs the disk task to create the torrent's files, which entails
    /// creating its directory structure and sizing every file to its
    /// declared length. The verdict arrives on the torrent's own channel as
    /// a `TorrentAllocation` message.
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        torrent_chan: torrent::Sender,
    ) -> Result<()> {
        self.0
            .send(Command::NewTorrent {
                id,
                storage_info,
                piece_hashes,
                torrent_chan,
            })
            .map_err(Into::into)
    }

    /// Queues a downloaded block for writing.
    pub fn write_block(
        &self,
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.0
            .send(Command::WriteBlock {
                id,
                block_info,
                data,
            })
            .map_err(Into::into)
    }

    /// Requests a block for uploading. The result is sent on the given
    /// channel, typically straight back into the requesting session's event
    /// loop.
    pub fn read_block(
        &self,
        id: TorrentId,
        block_info: BlockInfo,
        result_chan: BlockResultSender,
    ) -> Result<()> {
        self.0
            .send(Command::ReadBlock {
                id,
                block_info,
                result_chan,
            })
            .map_err(Into::into)
    }

    /// Requests that the piece is read back from disk and hashed, as part of
    /// a resume check. The verdict is sent to the torrent's channel.
    pub fn verify_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
    ) -> Result<()> {
        self.0
            .send(Command::VerifyPiece { id, piece_index })
            .map_err(Into::into)
    }

    /// Removes the torrent's entry, closing its file handles and dropping
    /// its caches and write buffers.
    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.0.send(Command::RemoveTorrent { id }).map_err(Into::into)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown).map_err(Into::into)
    }
}

pub(crate) type CommandSender = UnboundedSender<Command>;
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// The commands the disk task executes.
pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        torrent_chan: torrent::Sender,
    },
    WriteBlock {
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    },
    ReadBlock {
        id: TorrentId,
        block_info: BlockInfo,
        result_chan: BlockResultSender,
    },
    VerifyPiece {
        id: TorrentId,
        piece_index: PieceIndex,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    Shutdown,
}

/// A block read off the disk (or the read cache), ready to be wrapped in a
/// piece message.
#[derive(Clone, Debug)]
pub(crate) struct BlockRead {
    pub info: BlockInfo,
    pub data: CachedBlock,
}

pub(crate) type BlockResultSender =
    UnboundedSender<Result<BlockRead, ReadError>>;
pub(crate) type BlockResultReceiver =
    UnboundedReceiver<Result<BlockRead, ReadError>>;

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    ops::Range,
    os::unix::io::AsRawFd,
    path::PathBuf,
    sync::{
        self,
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use lru::LruCache;
use nix::sys::uio::{pread, pwritev};
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};

use super::{
    error::*, BlockRead, BlockResultSender, Command, CommandReceiver,
    CommandSender,
};
use crate::{
    block_count, block_len,
    error::Result,
    iovecs::IoVecs,
    storage_info::StorageInfo,
    torrent, BlockInfo, CachedBlock, FileIndex, PieceIndex, Sha1Hash,
    TorrentId, BLOCK_LEN,
};

/// How much memory a torrent's piece read cache may hold.
const READ_CACHE_MEM: u64 = 32 * 1024 * 1024;

/// The entity responsible for saving downloaded file blocks to disk,
/// serving block reads for uploads, and verifying pieces.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap.
    torrents: HashMap<TorrentId, tokio::sync::RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender.
    pub(super) fn new() -> Result<(Self, CommandSender)> {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            cmd_chan,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage_info,
                    piece_hashes,
                    torrent_chan,
                } => {
                    self.new_torrent(id, storage_info, piece_hashes, torrent_chan)?
                }
                // a command racing with its torrent's removal is dropped;
                // it must not kill the disk task
                Command::WriteBlock {
                    id,
                    block_info,
                    data,
                } => {
                    if let Some(torrent) = self.torrent(id) {
                        torrent
                            .write()
                            .await
                            .write_block(block_info, data)
                            .await?;
                    }
                }
                Command::ReadBlock {
                    id,
                    block_info,
                    result_chan,
                } => {
                    if let Some(torrent) = self.torrent(id) {
                        torrent
                            .read()
                            .await
                            .read_block(block_info, result_chan)
                            .await;
                    }
                }
                Command::VerifyPiece { id, piece_index } => {
                    if let Some(torrent) = self.torrent(id) {
                        torrent
                            .read()
                            .await
                            .verify_piece(piece_index)
                            .await?;
                    }
                }
                Command::RemoveTorrent { id } => {
                    if let Some(torrent) = self.torrents.remove(&id) {
                        let torrent = torrent.read().await;
                        let stats = &torrent.ctx.stats;
                        log::info!(
                            "Removed torrent {} from disk task \
                            ({} bytes written, {} bytes read, \
                            {} write failures, {} read failures)",
                            id,
                            stats.write_count.load(Ordering::Relaxed),
                            stats.read_count.load(Ordering::Relaxed),
                            stats.write_failure_count.load(Ordering::Relaxed),
                            stats.read_failure_count.load(Ordering::Relaxed),
                        );
                    }
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn new_torrent(
        &mut self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        torrent_chan: torrent::Sender,
    ) -> Result<()> {
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            torrent_chan.send(torrent::Message::TorrentAllocation(Err(
                NewTorrentError::AlreadyExists,
            )))?;
            return Ok(());
        }

        // NOTE: Do _NOT_ return on failure, we don't want to kill the disk
        // task due to potential disk IO errors: we just want to log it and
        // notify the torrent of it.
        match Torrent::new(storage_info, piece_hashes, torrent_chan.clone()) {
            Ok(torrent) => {
                log::info!("Torrent {} successfully allocated", id);
                self.torrents.insert(id, tokio::sync::RwLock::new(torrent));
                torrent_chan
                    .send(torrent::Message::TorrentAllocation(Ok(())))?;
            }
            Err(e) => {
                log::warn!("Torrent {} allocation failure: {}", id, e);
                torrent_chan
                    .send(torrent::Message::TorrentAllocation(Err(e)))?;
            }
        }
        Ok(())
    }

    fn torrent(&self, id: TorrentId) -> Option<&tokio::sync::RwLock<Torrent>> {
        let torrent = self.torrents.get(&id);
        if torrent.is_none() {
            log::warn!("Torrent {} not found in disk task", id);
        }
        torrent
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), the file
/// handles, the piece read cache, and the expected piece hashes.
struct Torrent {
    /// The in-progress piece downloads and disk writes. This is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Contains the fields that are also accessed by the IO worker threads.
    ///
    /// Blocking IO and hashing are spawned onto worker threads which need
    /// these fields; keeping them in a single arc means a single atomic
    /// increment per spawn.
    ctx: Arc<ThreadContext>,
}

/// Contains fields that are commonly accessed by the torrent's IO threads.
struct ThreadContext {
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed or verified.
    chan: torrent::Sender,
    /// The torrent's storage layout.
    info: StorageInfo,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// The read cache of whole pieces, each stored as its list of 16 KiB
    /// blocks since that is the granularity peers request. Bounded to
    /// [`READ_CACHE_MEM`] by evicting the least recently used piece.
    read_cache: Mutex<LruCache<PieceIndex, Vec<CachedBlock>>>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    ///
    /// Writer threads take exclusive access to the file handles they need;
    /// multiple reader threads may share one.
    files: Vec<sync::RwLock<TorrentFile>>,
    /// Various disk IO related statistics, updated by the IO worker threads
    /// themselves.
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: AtomicU64,
    /// The number of times we failed to write to disk.
    write_failure_count: AtomicUsize,
    /// The number of bytes successfully read from disk.
    read_count: AtomicU64,
    /// The number of times we failed to read from disk.
    read_failure_count: AtomicUsize,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// Missing directories (the download directory itself and any
    /// subdirectories of the archive) are created, and each file is sized to
    /// its declared length. If any file fails to open, the files opened
    /// before it are closed again and the error names the offending path.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        torrent_chan: torrent::Sender,
    ) -> Result<Self, NewTorrentError> {
        if !info.download_dir.is_dir() {
            log::info!(
                "Creating missing download directory {:?}",
                info.download_dir
            );
            fs::create_dir_all(&info.download_dir)?;
        }

        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            // dropping the already opened handles on an early return is the
            // rollback
            files.push(sync::RwLock::new(TorrentFile::new(
                &info.download_dir,
                file.clone(),
            )?));
        }

        let cache_entries = (READ_CACHE_MEM / info.piece_len as u64).max(1);
        Ok(Self {
            write_buf: HashMap::new(),
            ctx: Arc::new(ThreadContext {
                chan: torrent_chan,
                info,
                piece_hashes,
                read_cache: Mutex::new(LruCache::new(cache_entries as usize)),
                files,
                stats: Stats::default(),
            }),
        })
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {} to disk", info);

        let piece_index = info.piece_index;
        if !self.write_buf.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(piece_index) {
                self.ctx
                    .chan
                    .send(torrent::Message::PieceCompletion(Err(e)))?;
                // return with ok as the disk task itself shouldn't be
                // aborted due to invalid input
                return Ok(());
            }
        }
        let piece = self
            .write_buf
            .get_mut(&piece_index)
            .expect("Newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        // if the piece has all its blocks, it means we can hash it and save
        // it to disk and clear its write buffer
        if piece.is_complete() {
            let piece = self.write_buf.remove(&piece_index).unwrap();
            let ctx = Arc::clone(&self.ctx);

            log::debug!(
                "Piece {} is complete ({} bytes), hashing and flushing \
                {} block(s) to disk",
                piece_index,
                piece.len,
                piece.blocks.len()
            );

            // don't block the reactor with the potentially expensive hashing
            // and sync file writing
            task::spawn_blocking(move || {
                let is_valid = piece.matches_hash();

                let result = if is_valid {
                    let torrent_offset =
                        ctx.info.piece_offset(piece_index);
                    piece
                        .write(torrent_offset, &ctx.files)
                        .map(|write_count| {
                            ctx.stats
                                .write_count
                                .fetch_add(write_count as u64, Ordering::Relaxed);
                            torrent::PieceCompletion {
                                index: piece_index,
                                is_valid: true,
                            }
                        })
                } else {
                    log::warn!("Piece {} is NOT valid", piece_index);
                    Ok(torrent::PieceCompletion {
                        index: piece_index,
                        is_valid: false,
                    })
                };

                if result.is_err() {
                    ctx.stats
                        .write_failure_count
                        .fetch_add(1, Ordering::Relaxed);
                }

                // the torrent may be gone by the time the write finishes,
                // which is fine
                let _ = ctx
                    .chan
                    .send(torrent::Message::PieceCompletion(result));
            });
        }

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    ///
    /// This involves getting the expected hash of the piece, its length, and
    /// calculating the files that it intersects.
    fn start_new_piece(
        &mut self,
        piece_index: PieceIndex,
    ) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", piece_index);

        let expected_hash =
            expected_piece_hash(&self.ctx.piece_hashes, piece_index)
                .ok_or(WriteError::InvalidPieceIndex)?;
        log::debug!(
            "Piece {} expected hash {}",
            piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .ctx
            .info
            .piece_len(piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;

        let files = self
            .ctx
            .info
            .files_intersecting_piece(piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} intersects files: {:?}", piece_index, files);

        self.write_buf.insert(
            piece_index,
            Piece {
                expected_hash,
                len,
                blocks: BTreeMap::new(),
                files,
            },
        );

        Ok(())
    }

    /// Serves a block read, from the piece cache if the piece is in it, and
    /// otherwise by reading and caching the whole piece.
    async fn read_block(
        &self,
        info: BlockInfo,
        result_chan: BlockResultSender,
    ) {
        log::trace!("Reading block {} from disk", info);

        let block_index = info.index_in_piece();
        if let Some(blocks) =
            self.ctx.read_cache.lock().unwrap().get(&info.piece_index)
        {
            log::trace!("Piece {} is in the read cache", info.piece_index);
            if let Some(data) = blocks.get(block_index) {
                let _ = result_chan.send(Ok(BlockRead {
                    info,
                    data: Arc::clone(data),
                }));
            } else {
                let _ = result_chan.send(Err(ReadError::InvalidPieceIndex));
            }
            return;
        }

        // cache miss: read the whole piece on a worker thread and insert it
        let ctx = Arc::clone(&self.ctx);
        task::spawn_blocking(move || {
            let result = read_piece(&ctx, info.piece_index).map(|blocks| {
                ctx.read_cache
                    .lock()
                    .unwrap()
                    .put(info.piece_index, blocks.clone());
                blocks
            });

            let result = result.and_then(|blocks| {
                blocks
                    .get(block_index)
                    .map(|data| BlockRead {
                        info,
                        data: Arc::clone(data),
                    })
                    .ok_or(ReadError::InvalidPieceIndex)
            });

            if result.is_err() {
                ctx.stats
                    .read_failure_count
                    .fetch_add(1, Ordering::Relaxed);
            }
            let _ = result_chan.send(result);
        });
    }

    /// Reads the piece back from disk, hashes it, and reports to the torrent
    /// whether the content matches the expected digest. Part of the resume
    /// check.
    async fn verify_piece(&self, piece_index: PieceIndex) -> Result<()> {
        let expected_hash =
            match expected_piece_hash(&self.ctx.piece_hashes, piece_index) {
                Some(hash) => hash,
                None => {
                    self.ctx.chan.send(torrent::Message::PieceVerified {
                        piece_index,
                        result: Err(ReadError::InvalidPieceIndex),
                    })?;
                    return Ok(());
                }
            };

        let ctx = Arc::clone(&self.ctx);
        task::spawn_blocking(move || {
            let result = match read_piece_flat(&ctx, piece_index) {
                Ok(buf) => {
                    let digest = Sha1::digest(&buf);
                    Ok(digest.as_slice() == expected_hash)
                }
                // a file that shrank or disappeared simply fails the piece,
                // so it is downloaded again
                Err(ReadError::ShortRead) => Ok(false),
                Err(e) => Err(e),
            };
            let _ = ctx.chan.send(torrent::Message::PieceVerified {
                piece_index,
                result,
            });
        });
        Ok(())
    }
}

/// Returns the expected digest of the piece at the index, if the index is
/// within the hash string.
fn expected_piece_hash(hashes: &[u8], index: PieceIndex) -> Option<Sha1Hash> {
    let slice = hashes.get(index * 20..index * 20 + 20)?;
    let mut hash = [0; 20];
    hash.copy_from_slice(slice);
    Some(hash)
}

/// Reads the whole piece into a flat buffer. Runs on a worker thread.
fn read_piece_flat(
    ctx: &ThreadContext,
    index: PieceIndex,
) -> Result<Vec<u8>, ReadError> {
    let piece_len = ctx
        .info
        .piece_len(index)
        .map_err(|_| ReadError::InvalidPieceIndex)? as usize;
    let file_range = ctx
        .info
        .files_intersecting_piece(index)
        .map_err(|_| ReadError::InvalidPieceIndex)?;

    let mut buf = vec![0; piece_len];
    let mut torrent_offset = ctx.info.piece_offset(index);
    let mut pos = 0;

    for file in ctx.files[file_range].iter() {
        let file = file.read().unwrap();
        let slice = file
            .info
            .get_slice(torrent_offset, (piece_len - pos) as u64);
        debug_assert!(slice.len > 0);
        file.read_at(&mut buf[pos..pos + slice.len as usize], slice.offset)?;
        pos += slice.len as usize;
        torrent_offset += slice.len;
    }
    debug_assert_eq!(pos, piece_len);

    ctx.stats
        .read_count
        .fetch_add(piece_len as u64, Ordering::Relaxed);
    Ok(buf)
}

/// Reads the whole piece and splits it into reference counted blocks for
/// the read cache. Runs on a worker thread.
fn read_piece(
    ctx: &ThreadContext,
    index: PieceIndex,
) -> Result<Vec<CachedBlock>, ReadError> {
    let buf = read_piece_flat(ctx, index)?;
    let blocks = (0..block_count(buf.len() as u32))
        .map(|block_index| {
            let offset = block_index * BLOCK_LEN as usize;
            let len = block_len(buf.len() as u32, block_index) as usize;
            Arc::new(buf[offset..offset + len].to_vec())
        })
        .collect();
    Ok(blocks)
}

struct TorrentFile {
    /// The file's layout information; the path within is relative to the
    /// download directory.
    info: crate::storage_info::FileInfo,
    /// The file's absolute path, kept for error reports.
    path: PathBuf,
    handle: File,
}

impl TorrentFile {
    /// Opens the file, creating it and its parent directories as needed, and
    /// sizes it to its declared length.
    ///
    /// The file is first opened for writing; if that fails (e.g. seeding
    /// from read-only storage), a read-only open is attempted before giving
    /// up. Read-only files are served as is and not resized.
    fn new(
        download_dir: &std::path::Path,
        info: crate::storage_info::FileInfo,
    ) -> Result<Self, NewTorrentError> {
        let path = download_dir.join(&info.path);
        debug_assert!(!info.path.is_absolute());

        // get the parent of the file path: if there is one (i.e. this is
        // not a file in the torrent root), and doesn't exist, create it
        if let Some(subdir) = path.parent() {
            if !subdir.exists() {
                log::info!("Creating torrent subdir {:?}", subdir);
                fs::create_dir_all(&subdir).map_err(|e| {
                    log::warn!("Failed to create subdir {:?}", subdir);
                    NewTorrentError::Io(e)
                })?;
            }
        }

        let open_error = |source| NewTorrentError::Open {
            path: path.clone(),
            source,
        };

        let writable = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path);
        let handle = match writable {
            Ok(handle) => {
                // size the file to its declared length so that piece reads
                // anywhere in it succeed
                let disk_len = handle.metadata().map_err(open_error)?.len();
                if disk_len != info.len {
                    handle.set_len(info.len).map_err(open_error)?;
                }
                handle
            }
            Err(e) => {
                log::warn!(
                    "Failed to open {:?} for writing ({}), trying read-only",
                    path,
                    e
                );
                File::open(&path).map_err(open_error)?
            }
        };

        Ok(Self { info, path, handle })
    }

    /// Writes to the file from the front of the given buffers at the given
    /// file offset, and returns the number of bytes written.
    fn write_vectored_at(
        &self,
        iovecs: &mut IoVecs<'_>,
        mut offset: u64,
    ) -> Result<usize, WriteError> {
        // IO syscalls are not guaranteed to write the whole input in one
        // go, so we need to write until all bytes have been confirmed to be
        // written to disk (or an error occurs)
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count =
                pwritev(self.handle.as_raw_fd(), iovecs.buffers(), offset as i64)
                    .map_err(|e| {
                        log::warn!("File {:?} write error: {}", self.path, e);
                        WriteError::Io(nix_to_io(e))
                    })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
            offset += write_count as u64;
        }
        Ok(total_write_count)
    }

    /// Fills the whole buffer from the file starting at the given file
    /// offset.
    fn read_at(
        &self,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> Result<(), ReadError> {
        while !buf.is_empty() {
            let read_count =
                pread(self.handle.as_raw_fd(), buf, offset as i64).map_err(
                    |e| {
                        log::warn!("File {:?} read error: {}", self.path, e);
                        ReadError::Io(nix_to_io(e))
                    },
                )?;
            if read_count == 0 {
                log::warn!(
                    "File {:?} shorter than declared length",
                    self.path
                );
                return Err(ReadError::ShortRead);
            }
            buf = &mut buf[read_count..];
            offset += read_count as u64;
        }
        Ok(())
    }
}

fn nix_to_io(e: nix::Error) -> std::io::Error {
    match e.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(std::io::ErrorKind::Other, e),
    }
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks. Once the size of this map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash is
    /// correct, saved to disk.
    ///
    /// Blocks are mapped to their offset within piece, and a BTreeMap keeps
    /// the keys sorted, which matters when hashing and flushing the blocks
    /// in piece order.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with, as a left-inclusive range of
    /// file indices.
    files: Range<FileIndex>,
}

impl Piece {
    /// Places the block into the piece's write buffer, dropping duplicate
    /// arrivals (which happen in endgame when the cancel loses the race).
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a worker
    /// thread and not the executor.
    fn matches_hash(&self) -> bool {
        // sanity check that we only call this method if we have all blocks
        // in piece
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        log::debug!("Piece hash: {}", hex::encode(&hash));
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a worker thread and not the executor.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[sync::RwLock<TorrentFile>],
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;

        // need to convert the blocks to IO slices that the underlying
        // syscall can deal with
        let mut blocks: Vec<_> = self
            .blocks
            .values()
            .map(|b| nix::sys::uio::IoVec::from_slice(b))
            .collect();
        let mut bufs = blocks.as_mut_slice();
        // the offset at which we need to write in torrent, updated with
        // each file's write
        let mut write_torrent_offset = piece_torrent_offset;
        let mut remaining_len = self.len as u64;

        // loop through all files the piece overlaps with and write that
        // part of piece to the file
        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());
        for file in files.iter() {
            let file = file.write().unwrap();
            // determine which part of the file we need to write to
            let slice =
                file.info.get_slice(write_torrent_offset, remaining_len);
            // an empty file slice would mean the piece was thought to span
            // more files than it actually does
            debug_assert!(slice.len > 0);
            debug_assert!(!bufs.is_empty());

            // take the buffers that belong to this file
            let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
            let write_count =
                file.write_vectored_at(&mut iovecs, slice.offset)?;
            debug_assert_eq!(write_count as u64, slice.len);

            // the rest of the buffers are for the next files
            bufs = iovecs.into_tail();

            write_torrent_offset += write_count as u64;
            remaining_len -= write_count as u64;
            total_write_count += write_count;
        }

        // we should have used up all write buffers (i.e. written all blocks
        // to disk)
        debug_assert!(bufs.is_empty());
        debug_assert_eq!(total_write_count as u64, self.len as u64);

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::storage_info::FileInfo;

    const PIECE_LEN: u32 = 4 * BLOCK_LEN;

    fn storage_fixture(
        dir: &TempDir,
        file_lens: &[u64],
        piece_count: usize,
        last_piece_len: u32,
    ) -> StorageInfo {
        let mut torrent_offset = 0;
        let files: Vec<_> = file_lens
            .iter()
            .enumerate()
            .map(|(index, len)| {
                let file = FileInfo {
                    path: PathBuf::from(format!("file-{}", index)),
                    len: *len,
                    torrent_offset,
                };
                torrent_offset += len;
                file
            })
            .collect();
        StorageInfo {
            piece_count,
            piece_len: PIECE_LEN,
            last_piece_len,
            download_len: file_lens.iter().sum(),
            download_dir: dir.path().to_path_buf(),
            files,
        }
    }

    fn make_piece(info: &StorageInfo, index: PieceIndex) -> (Piece, Vec<u8>) {
        let len = info.piece_len(index).unwrap();
        let mut content = vec![0u8; len as usize];
        for (pos, byte) in content.iter_mut().enumerate() {
            *byte = (pos % 251) as u8;
        }
        let mut blocks = BTreeMap::new();
        for block_index in 0..block_count(len) {
            let offset = block_index as u32 * BLOCK_LEN;
            let block_len = block_len(len, block_index) as usize;
            blocks.insert(
                offset,
                content[offset as usize..offset as usize + block_len]
                    .to_vec(),
            );
        }
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(&Sha1::digest(&content));
        let piece = Piece {
            expected_hash,
            len,
            blocks,
            files: info.files_intersecting_piece(index).unwrap(),
        };
        (piece, content)
    }

    fn open_files(info: &StorageInfo) -> Vec<sync::RwLock<TorrentFile>> {
        info.files
            .iter()
            .map(|f| {
                sync::RwLock::new(
                    TorrentFile::new(&info.download_dir, f.clone()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_files_are_created_and_sized() {
        let dir = TempDir::new().unwrap();
        let info = storage_fixture(
            &dir,
            &[PIECE_LEN as u64 + 100, PIECE_LEN as u64 - 100],
            2,
            PIECE_LEN,
        );
        let files = open_files(&info);

        for (file, info) in files.iter().zip(info.files.iter()) {
            let meta = file.read().unwrap().handle.metadata().unwrap();
            assert_eq!(meta.len(), info.len);
        }
    }

    #[test]
    fn test_piece_write_and_read_back_across_files() {
        let dir = TempDir::new().unwrap();
        // piece 1 straddles all three files
        let file_lens =
            [PIECE_LEN as u64 + 300, 500, PIECE_LEN as u64 - 800];
        let info = storage_fixture(&dir, &file_lens, 2, PIECE_LEN);
        let files = open_files(&info);

        let (piece, content) = make_piece(&info, 1);
        assert!(piece.matches_hash());
        let write_count =
            piece.write(info.piece_offset(1), &files).unwrap();
        assert_eq!(write_count, PIECE_LEN as usize);

        // reading the same byte range back returns the written bytes,
        // regardless of the file boundaries in between
        let ctx = ThreadContext {
            chan: tokio::sync::mpsc::unbounded_channel().0,
            info,
            piece_hashes: {
                let mut hashes = vec![0; 40];
                hashes[20..].copy_from_slice(&piece.expected_hash);
                hashes
            },
            read_cache: Mutex::new(LruCache::new(4)),
            files,
            stats: Stats::default(),
        };
        let read_back = read_piece_flat(&ctx, 1).unwrap();
        assert_eq!(read_back, content);

        // and the cached block view splits it 16 KiB wise
        let blocks = read_piece(&ctx, 1).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(*blocks[0], content[..BLOCK_LEN as usize]);
    }

    #[test]
    fn test_corrupt_piece_fails_hash_check() {
        let dir = TempDir::new().unwrap();
        let info =
            storage_fixture(&dir, &[2 * PIECE_LEN as u64], 2, PIECE_LEN);

        let (mut piece, _) = make_piece(&info, 0);
        piece
            .blocks
            .get_mut(&BLOCK_LEN)
            .unwrap()
            .iter_mut()
            .for_each(|b| *b = !*b);
        assert!(!piece.matches_hash());
    }

    #[test]
    fn test_duplicate_blocks_are_dropped() {
        let dir = TempDir::new().unwrap();
        let info =
            storage_fixture(&dir, &[2 * PIECE_LEN as u64], 2, PIECE_LEN);
        let (mut piece, content) = make_piece(&info, 0);

        // a late duplicate (endgame race) must not replace the original
        piece.enqueue_block(0, vec![0xff; BLOCK_LEN as usize]);
        assert_eq!(
            piece.blocks.get(&0).unwrap(),
            &content[..BLOCK_LEN as usize]
        );
    }

    #[test]
    fn test_short_file_read_is_detected() {
        let dir = TempDir::new().unwrap();
        let info =
            storage_fixture(&dir, &[PIECE_LEN as u64], 1, PIECE_LEN);
        let files = open_files(&info);

        // shrink the file behind the torrent's back
        files[0]
            .read()
            .unwrap()
            .handle
            .set_len(PIECE_LEN as u64 / 2)
            .unwrap();

        let ctx = ThreadContext {
            chan: tokio::sync::mpsc::unbounded_channel().0,
            info,
            piece_hashes: vec![0; 20],
            read_cache: Mutex::new(LruCache::new(4)),
            files,
            stats: Stats::default(),
        };
        assert!(matches!(
            read_piece_flat(&ctx, 0),
            Err(ReadError::ShortRead)
        ));
    }
}

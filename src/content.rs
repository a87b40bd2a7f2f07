//! Torrent content bookkeeping.
//!
//! [`Content`] tracks what the torrent *is* (file list, piece hashes, piece
//! size) and how much of it we have (the piece bitfield, per file completion
//! counters, bytes completed). The file descriptors themselves are owned by
//! the disk task; this type only does the accounting.
//!
//! The metadata is mutable only while the content is closed. Opening
//! validates that the hash string, the file list and the piece geometry
//! agree, and freezes the shape.

use std::{ops::Range, path::PathBuf};

use crate::{
    error::*,
    storage_info::{FileInfo, StorageInfo},
    Bitfield, BlockInfo, FileIndex, PieceIndex,
};

/// How eagerly a file's pieces are downloaded. `Skip` excludes the file's
/// pieces from piece selection altogether.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilePriority {
    Skip = 0,
    Normal = 1,
    High = 2,
}

impl FilePriority {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Skip),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

/// A file of the torrent, with its download priority and how many of the
/// pieces overlapping it are complete.
#[derive(Clone, Debug)]
pub(crate) struct ContentFile {
    pub path: PathBuf,
    pub len: u64,
    pub priority: FilePriority,
    /// The number of complete pieces in the file's piece range. A piece
    /// straddling a file boundary counts towards every file it touches.
    pub pieces_done: usize,
}

/// The state that only exists while the content is open.
#[derive(Debug)]
struct OpenContent {
    storage: StorageInfo,
    pieces: Bitfield,
    completed: usize,
}

#[derive(Debug)]
pub(crate) struct Content {
    piece_len: u32,
    root_dir: PathBuf,
    files: Vec<ContentFile>,
    piece_hashes: Vec<u8>,
    total_len: u64,
    open: Option<OpenContent>,
}

impl Content {
    pub fn new(piece_len: u32) -> Self {
        Self {
            piece_len,
            root_dir: PathBuf::from("."),
            files: Vec::new(),
            piece_hashes: Vec::new(),
            total_len: 0,
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Appends a file to the content. Only allowed while closed.
    pub fn add_file(
        &mut self,
        path: impl Into<PathBuf>,
        len: u64,
    ) -> Result<()> {
        if self.is_open() {
            return Err(Error::InvalidState("add_file on open content"));
        }
        self.files.push(ContentFile {
            path: path.into(),
            len,
            priority: FilePriority::Normal,
            pieces_done: 0,
        });
        self.total_len += len;
        Ok(())
    }

    /// Installs the concatenated piece hash string. Only allowed while
    /// closed.
    pub fn set_complete_hash(&mut self, hashes: Vec<u8>) -> Result<()> {
        if self.is_open() {
            return Err(Error::InvalidState("set_complete_hash on open content"));
        }
        self.piece_hashes = hashes;
        Ok(())
    }

    /// Sets the directory the files are downloaded into. Only allowed while
    /// closed.
    pub fn set_root_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        if self.is_open() {
            return Err(Error::InvalidState("set_root_dir on open content"));
        }
        self.root_dir = dir.into();
        Ok(())
    }

    pub fn set_file_priority(
        &mut self,
        index: FileIndex,
        priority: FilePriority,
    ) -> Result<()> {
        let file = self
            .files
            .get_mut(index)
            .ok_or(Error::InvalidState("no such file"))?;
        file.priority = priority;
        Ok(())
    }

    /// Freezes the metadata and initializes the completion state.
    ///
    /// # Panics
    ///
    /// Panics if the hash string length disagrees with the piece count
    /// implied by the file sizes: both come from the same validated
    /// metainfo, so a mismatch is a bug in the caller.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::InvalidState("content already open"));
        }
        if self.files.is_empty() || self.total_len == 0 {
            return Err(Error::InvalidState("no files added"));
        }

        let piece_count = (self.total_len + self.piece_len as u64 - 1)
            / self.piece_len as u64;
        let piece_count = piece_count as usize;
        assert_eq!(
            self.piece_hashes.len() / 20,
            piece_count,
            "piece hash count does not match piece count"
        );
        assert_eq!(self.piece_hashes.len() % 20, 0);

        let mut torrent_offset = 0;
        let files: Vec<_> = self
            .files
            .iter()
            .map(|f| {
                let info = FileInfo {
                    path: f.path.clone(),
                    len: f.len,
                    torrent_offset,
                };
                torrent_offset += f.len;
                info
            })
            .collect();
        debug_assert_eq!(torrent_offset, self.total_len);

        let last_piece_len = self.total_len
            - self.piece_len as u64 * (piece_count as u64 - 1);
        self.open = Some(OpenContent {
            storage: StorageInfo {
                piece_count,
                piece_len: self.piece_len,
                last_piece_len: last_piece_len as u32,
                download_len: self.total_len,
                download_dir: self.root_dir.clone(),
                files,
            },
            pieces: Bitfield::repeat(false, piece_count),
            completed: 0,
        });
        for file in self.files.iter_mut() {
            file.pieces_done = 0;
        }
        Ok(())
    }

    /// Releases the completion state. The metadata becomes mutable again.
    pub fn close(&mut self) {
        self.open = None;
        for file in self.files.iter_mut() {
            file.pieces_done = 0;
        }
    }

    pub fn files(&self) -> &[ContentFile] {
        &self.files
    }

    /// The torrent's storage layout. Only available while open.
    ///
    /// # Panics
    ///
    /// Panics if the content is closed.
    pub fn storage(&self) -> &StorageInfo {
        &self.open.as_ref().expect("content not open").storage
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// Returns the length of the piece at the given index, accounting for
    /// a shorter last piece.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of range.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        let piece_count = self.piece_count();
        assert!(index < piece_count, "piece index out of range");
        if index + 1 == piece_count && self.total_len % self.piece_len as u64 != 0
        {
            (self.total_len % self.piece_len as u64) as u32
        } else {
            self.piece_len
        }
    }

    pub fn pieces(&self) -> &Bitfield {
        &self.open.as_ref().expect("content not open").pieces
    }

    pub fn completed_count(&self) -> usize {
        self.open.as_ref().map(|open| open.completed).unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.open
            .as_ref()
            .map(|open| open.completed == open.storage.piece_count)
            .unwrap_or(false)
    }

    /// Records the piece at the given index as complete and updates the per
    /// file counters. Returns true if this was the torrent's last piece.
    ///
    /// Must only be called after the piece's hash has been verified.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of range, the piece is already marked, or
    /// the completed count would exceed the piece count; all of these are
    /// bugs in the caller.
    pub fn mark_done(&mut self, index: PieceIndex) -> bool {
        let open = self.open.as_mut().expect("content not open");
        assert!(
            index < open.storage.piece_count,
            "mark_done index out of range"
        );
        assert!(!open.pieces[index], "piece already marked done");
        assert!(open.completed < open.storage.piece_count);

        open.pieces.set(index, true);
        open.completed += 1;

        let files = open.storage.files_intersecting_piece(index).unwrap();
        for file in &mut self.files[files] {
            file.pieces_done += 1;
        }

        open.completed == open.storage.piece_count
    }

    /// Recomputes the completed count and the per file counters from the
    /// bitfield. Used after bulk bitfield edits (resume load, invalidation).
    pub fn update_done(&mut self) {
        let open = self.open.as_mut().expect("content not open");
        open.completed = open.pieces.count_ones();

        for (index, file) in self.files.iter_mut().enumerate() {
            let pieces = open.storage.pieces_intersecting_file(index);
            file.pieces_done = open.pieces[pieces].count_ones();
        }
    }

    /// Overwrites the bitfield with one loaded from fast-resume data.
    /// Returns false, leaving the state untouched, if the raw bytes don't
    /// have the exact expected width.
    pub fn install_pieces(&mut self, raw: Vec<u8>) -> bool {
        let open = self.open.as_mut().expect("content not open");
        let piece_count = open.storage.piece_count;
        if raw.len() != (piece_count + 7) / 8 {
            return false;
        }
        let mut pieces = Bitfield::from_vec(raw);
        // the logical width is the piece count; bits past it are padding
        pieces.truncate(piece_count);
        open.pieces = pieces;
        self.update_done();
        true
    }

    /// Clears the completion bits of the given piece range, ahead of
    /// re-verifying them.
    pub fn clear_pieces(&mut self, range: Range<PieceIndex>) {
        let open = self.open.as_mut().expect("content not open");
        for index in range {
            open.pieces.set(index, false);
        }
        self.update_done();
    }

    /// Serializes the bitfield into packed bytes with zero padding bits.
    pub fn pieces_to_bytes(&self) -> Vec<u8> {
        let open = self.open.as_ref().expect("content not open");
        let mut bytes = vec![0u8; (open.storage.piece_count + 7) / 8];
        for (index, bit) in open.pieces.iter().enumerate() {
            if *bit {
                bytes[index / 8] |= 0x80 >> (index % 8);
            }
        }
        bytes
    }

    /// The number of bytes of the download that are complete and verified.
    ///
    /// All pieces are the nominal piece length except possibly the last one,
    /// so the count of completed pieces determines the byte count once we
    /// know whether the last, possibly shorter, piece is among them.
    pub fn bytes_completed(&self) -> u64 {
        let open = match &self.open {
            Some(open) => open,
            None => return 0,
        };
        let piece_len = self.piece_len as u64;
        let tail = self.total_len % piece_len;

        let last_piece_done =
            open.pieces[open.storage.piece_count - 1] && tail != 0;
        if last_piece_done {
            (open.completed as u64 - 1) * piece_len + tail
        } else {
            open.completed as u64 * piece_len
        }
    }

    pub fn bytes_left(&self) -> u64 {
        self.total_len - self.bytes_completed()
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Returns true if the piece descriptor refers to a real block of the
    /// torrent and respects the wire protocol limits.
    pub fn is_valid_piece(&self, block: BlockInfo) -> bool {
        block.piece_index < self.piece_count()
            && block.is_valid(self.piece_len(block.piece_index))
    }
}

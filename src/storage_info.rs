use std::{ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the last
    /// bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the range starting at the
    /// given offset.
    ///
    /// # Arguments
    ///
    /// * `torrent_offset` - A byte offset in the entire torrent.
    /// * `len` - The length of the byte range, starting from the offset. This
    ///         may exceed the file length, in which case the returned file
    ///         length will be smaller.
    ///
    /// # Panics
    ///
    /// This will panic if `torrent_offset` is smaller than the file's offset
    /// in torrent, or if it's past the last byte in file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, and the layout of files over the torrent's byte
/// stream.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of single file downloads, this is the directory where the file
    /// is placed, named as the torrent. In case of archive downloads, this is
    /// the user's download directory joined by the torrent's name, so that a
    /// torrent with multiple top-level entries doesn't scatter its contents
    /// across the download directory.
    pub download_dir: PathBuf,
    /// All files in the torrent, ordered by their offset in the torrent. The
    /// offsets are contiguous: each file begins where the previous one ends.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.download_len();
        let piece_len = metainfo.piece_len;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        // if this is an archive, download files into the torrent's own dir
        let download_dir = if metainfo.is_archive {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files: metainfo.files.clone(),
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the piece's first byte's offset in the torrent.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the zero-based indices of the files of torrent that intersect
    /// with the piece.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        log::trace!("Returning files intersecting piece {}", index);
        let piece_offset = self.piece_offset(index);
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// bytes, where `byte_range.start` is the offset and `byte_range.end` one
    /// past the last byte offset.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        // find the file containing the first byte of the range
        let first = match self
            .files
            .iter()
            .position(|f| f.byte_range().contains(&byte_range.start))
        {
            Some(index) => index,
            None => return 0..0,
        };

        // walk forward while files still begin before the end of the range
        let past_last = self
            .files
            .iter()
            .skip(first + 1)
            .take_while(|f| byte_range.contains(&f.torrent_offset))
            .count()
            + first
            + 1;

        first..past_last
    }

    /// Returns the left-inclusive range of pieces that overlap the file at
    /// the given index. Needed when invalidating a file during a resume
    /// check and when attributing completed pieces to files.
    ///
    /// # Panics
    ///
    /// Panics if the file index is out of bounds.
    pub fn pieces_intersecting_file(
        &self,
        index: FileIndex,
    ) -> Range<PieceIndex> {
        let file = &self.files[index];
        if file.len == 0 {
            // zero length files own no pieces
            let piece = (file.torrent_offset / self.piece_len as u64) as usize;
            return piece..piece;
        }
        let first = file.torrent_offset / self.piece_len as u64;
        let last = (file.torrent_end_offset() - 1) / self.piece_len as u64;
        first as PieceIndex..last as PieceIndex + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_get_slice() {
        let file = FileInfo {
            // file doesn't need to exist as we're not doing any IO in this test
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice {
                offset: 300 - 200,
                len: 500 - (300 - 200),
            },
            "file slice for byte range longer than file should return \
            at most file length long slice"
        );

        assert_eq!(
            file.get_slice(300, 10),
            FileSlice {
                offset: 300 - 200,
                len: 10,
            },
            "file slice for byte range smaller than file should return \
            at most byte range long slice"
        );

        assert_eq!(
            file.get_slice(200, 500),
            FileSlice {
                offset: 0,
                len: 500,
            },
            "file slice for byte range equal to file length should return \
            the full file slice"
        );
    }

    #[test]
    #[should_panic(expected = "torrent offset must be larger than file offset")]
    fn test_file_get_slice_starting_before_file() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        // we can't query a file slice for a byte range starting before the
        // file
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic(
        expected = "torrent offset must be smaller than file end offset"
    )]
    fn test_file_get_slice_starting_after_file() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        // we can't query a file slice for a byte range starting past the file
        file.get_slice(200 + 500, 400);
    }

    /// A fixture with seven files over five pieces.
    ///
    /// pieces: (index:first byte offset)
    /// --------------------------------------------------------------------
    /// |0:0         |1:16          |2:32          |3:48          |4:64    |
    /// --------------------------------------------------------------------
    /// files: (index:first byte offset,last byte offset)
    /// --------------------------------------------------------------------
    /// |0:0,8 |1:9,19  |2:20,26|3:27,35 |4:36,47  |5:48,63       |6:64,71 |
    /// --------------------------------------------------------------------
    fn archive_fixture() -> StorageInfo {
        let file_lens = [9, 11, 7, 9, 12, 16, 8];
        let mut torrent_offset = 0;
        let files: Vec<_> = file_lens
            .iter()
            .enumerate()
            .map(|(index, len)| {
                let file = FileInfo {
                    path: PathBuf::from(format!("/{}", index)),
                    torrent_offset,
                    len: *len,
                };
                torrent_offset += *len;
                file
            })
            .collect();
        let download_len: u64 = files.iter().map(|f| f.len).sum();
        let piece_count: usize = 5;
        let piece_len: u32 = 16;
        let last_piece_len: u32 = 8;
        // sanity check that full piece lengths and last piece length equal
        // the total download length
        debug_assert_eq!(
            (piece_count as u64 - 1) * piece_len as u64 + last_piece_len as u64,
            download_len
        );
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            files,
        }
    }

    #[test]
    fn test_files_intersecting_pieces() {
        // single file: all pieces are in the same file
        let info = StorageInfo {
            piece_count: 4,
            piece_len: 4,
            last_piece_len: 2,
            download_len: 3 * 4 + 2,
            download_dir: PathBuf::from("/"),
            files: vec![FileInfo {
                path: PathBuf::from("/bogus"),
                torrent_offset: 0,
                len: 3 * 4 + 2,
            }],
        };
        for index in 0..4 {
            assert_eq!(info.files_intersecting_piece(index).unwrap(), 0..1);
        }

        let info = archive_fixture();
        // piece 0 intersects with files 0 and 1
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        // piece 1 intersects with files 1, 2, 3
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
        // piece 2 intersects with files 3 and 4
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..5);
        // piece 3 intersects with only file 5
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 5..6);
        // last piece 4 intersects with only file 6
        assert_eq!(info.files_intersecting_piece(4).unwrap(), 6..7);
        // piece 5 is invalid
        assert!(info.files_intersecting_piece(5).is_err());
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let info = StorageInfo {
            piece_count: 7,
            piece_len: 4,
            last_piece_len: 2,
            download_len: 26,
            download_dir: PathBuf::from("/"),
            files: vec![
                FileInfo {
                    path: PathBuf::from("/bogus0"),
                    torrent_offset: 0,
                    len: 4,
                },
                FileInfo {
                    path: PathBuf::from("/bogus1"),
                    torrent_offset: 4,
                    len: 9,
                },
                FileInfo {
                    path: PathBuf::from("/bogus2"),
                    torrent_offset: 13,
                    len: 3,
                },
                FileInfo {
                    path: PathBuf::from("/bogus3"),
                    torrent_offset: 16,
                    len: 10,
                },
            ],
        };
        // bytes only in the first file
        assert_eq!(info.files_intersecting_bytes(0..4), 0..1);
        // bytes intersecting two files
        assert_eq!(info.files_intersecting_bytes(0..5), 0..2);
        // bytes overlapping with two files
        assert_eq!(info.files_intersecting_bytes(0..13), 0..2);
        // bytes intersecting three files
        assert_eq!(info.files_intersecting_bytes(0..15), 0..3);
        // bytes intersecting all files
        assert_eq!(info.files_intersecting_bytes(0..18), 0..4);
        // bytes intersecting the last byte of the last file
        assert_eq!(info.files_intersecting_bytes(25..26), 3..4);
        // bytes overlapping with two files in the middle
        assert_eq!(info.files_intersecting_bytes(4..16), 1..3);
        // bytes intersecting only one byte of two files each, among the
        // middle of all files
        assert_eq!(info.files_intersecting_bytes(8..14), 1..3);
        // bytes intersecting only one byte of one file, among the middle of
        // all files
        assert_eq!(info.files_intersecting_bytes(13..14), 2..3);
        // bytes not intersecting any files
        assert_eq!(info.files_intersecting_bytes(30..38), 0..0);
    }

    #[test]
    fn test_pieces_intersecting_file() {
        let info = archive_fixture();
        // file 0 (bytes 0-8) is inside piece 0
        assert_eq!(info.pieces_intersecting_file(0), 0..1);
        // file 1 (bytes 9-19) straddles pieces 0 and 1
        assert_eq!(info.pieces_intersecting_file(1), 0..2);
        // file 4 (bytes 36-47) lies inside piece 2 (bytes 32-47)
        assert_eq!(info.pieces_intersecting_file(4), 2..3);
        // file 5 (bytes 48-63) is exactly piece 3
        assert_eq!(info.pieces_intersecting_file(5), 3..4);
        // file 6 (bytes 64-71) is exactly the last piece
        assert_eq!(info.pieces_intersecting_file(6), 4..5);
    }
}

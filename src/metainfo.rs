//! Torrent metainfo (.torrent file) parsing and validation.

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use url::Url;

use crate::{error::*, storage_info::FileInfo, Sha1Hash};

/// The parsed and validated contents of a .torrent file.
///
/// Only the fields the engine needs are kept; the raw info dictionary is
/// hashed during parsing to produce the torrent's identity.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent, used as the file name of single file
    /// downloads and as the directory name of archives.
    pub name: String,
    /// The SHA-1 hash of the bencoded info dictionary.
    pub info_hash: Sha1Hash,
    /// The nominal piece length. The last piece may be shorter.
    pub piece_len: u32,
    /// The concatenation of each piece's expected SHA-1 digest, 20 bytes per
    /// piece.
    pub piece_hashes: Vec<u8>,
    /// Whether the download consists of multiple files under a torrent
    /// directory, as opposed to a single file.
    pub is_archive: bool,
    /// All files in the torrent in announce order, with their offsets in the
    /// torrent's contiguous byte stream filled in. Single file torrents have
    /// exactly one entry.
    pub files: Vec<FileInfo>,
    /// Tracker URL tiers, in BEP 12 order: the inner vectors are fallback
    /// lists, the outer vector orders the tiers themselves.
    pub trackers: Vec<Vec<Url>>,
    /// The creation time of the torrent, in seconds since the epoch.
    pub creation_date: Option<i64>,
}

impl Metainfo {
    /// Parses a .torrent file's bytes, validating the invariants the engine
    /// relies on: a positive piece length, a hash string covering exactly the
    /// torrent's pieces, and well formed relative file paths.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: Raw = serde_bencode::from_bytes(buf)?;
        let info = raw.info;

        if info.name.is_empty() {
            return Err(Error::InvalidMetainfo("empty name"));
        }
        if info.piece_len == 0 {
            return Err(Error::InvalidMetainfo("zero piece length"));
        }
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "piece hash string not a multiple of 20 bytes",
            ));
        }

        // exactly one of `length` and `files` must be present
        let files = match (info.len, &info.files) {
            (Some(len), None) => {
                if len == 0 {
                    return Err(Error::InvalidMetainfo("zero length file"));
                }
                vec![FileInfo {
                    path: PathBuf::from(&info.name),
                    len,
                    torrent_offset: 0,
                }]
            }
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(Error::InvalidMetainfo("empty file list"));
                }
                let mut files = Vec::with_capacity(raw_files.len());
                let mut torrent_offset = 0;
                for file in raw_files.iter() {
                    files.push(FileInfo {
                        path: sanitize_path(&file.path)?,
                        len: file.len,
                        torrent_offset,
                    });
                    torrent_offset += file.len;
                }
                files
            }
            _ => {
                return Err(Error::InvalidMetainfo(
                    "exactly one of `length` and `files` expected",
                ))
            }
        };

        // the hash string must cover exactly the pieces the download length
        // implies
        let download_len: u64 = files.iter().map(|f| f.len).sum();
        let piece_count = (download_len + info.piece_len as u64 - 1)
            / info.piece_len as u64;
        if piece_count != (info.pieces.len() / 20) as u64 {
            return Err(Error::InvalidMetainfo(
                "piece hash count doesn't match piece count",
            ));
        }

        let info_hash = info.create_hash()?;

        // announce-list takes precedence over the single announce key, per
        // BEP 12; URLs that don't parse are skipped, empty tiers dropped
        let mut trackers = Vec::new();
        if let Some(tiers) = &raw.announce_list {
            for tier in tiers.iter() {
                let tier: Vec<_> = tier
                    .iter()
                    .filter_map(|url| Url::parse(url).ok())
                    .collect();
                if !tier.is_empty() {
                    trackers.push(tier);
                }
            }
        }
        if trackers.is_empty() {
            if let Some(announce) = &raw.announce {
                if let Ok(url) = Url::parse(announce) {
                    trackers.push(vec![url]);
                }
            }
        }

        Ok(Self {
            name: info.name,
            info_hash,
            piece_len: info.piece_len,
            piece_hashes: info.pieces.into_vec(),
            is_archive: info.files.is_some(),
            files,
            trackers,
            creation_date: raw.creation_date,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// The sum of all file lengths, i.e. the size of the whole download.
    pub fn download_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }
}

/// Turns a file's bencoded path component list into a relative path, refusing
/// anything that could escape the download directory.
fn sanitize_path(components: &[String]) -> Result<PathBuf> {
    if components.is_empty() {
        return Err(Error::InvalidMetainfo("empty file path"));
    }
    let mut path = PathBuf::new();
    for component in components.iter() {
        if component.is_empty() {
            return Err(Error::InvalidMetainfo("empty file path component"));
        }
        if component == ".." || component.contains('/') {
            return Err(Error::InvalidMetainfo("file path escapes root"));
        }
        path.push(component);
    }
    Ok(path)
}

#[derive(Debug, Deserialize)]
struct Raw {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    info: Info,
}

/// The torrent's info dictionary.
///
/// The fields are declared in their bencode sorted key order so that
/// re-serializing a parsed dictionary reproduces the canonical byte string
/// and with it the info hash.
#[derive(Debug, Serialize, Deserialize)]
struct Info {
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<File>>,
    #[serde(rename = "length", skip_serializing_if = "Option::is_none")]
    len: Option<u64>,
    name: String,
    #[serde(rename = "piece length")]
    piece_len: u32,
    pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

impl Info {
    fn create_hash(&self) -> Result<Sha1Hash> {
        let encoded = serde_bencode::to_bytes(self)?;
        let digest = Sha1::digest(&encoded);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct File {
    #[serde(rename = "length")]
    len: u64,
    path: Vec<String>,
}

//! Fast-resume data.
//!
//! To avoid re-hashing a whole torrent on restart, the engine persists a
//! small bencoded record of the completion bitfield, each file's
//! modification time and priority, and the known peer addresses. On load,
//! any file whose on-disk size or mtime disagrees with the record has its
//! piece range re-verified; the rest of the bitfield is trusted as is.
//!
//! The record lives under the `libtorrent resume` key of a bencoded map, so
//! it can be embedded alongside the torrent's own metainfo keys in one
//! file.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::*;

/// The size of one compact peer address entry: a 4 byte IPv4 address
/// followed by a big endian port.
const COMPACT_ADDR_LEN: usize = 6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct ResumeData {
    /// The completion bitfield, packed with zero padding, exactly as wide
    /// as the torrent's piece count requires.
    #[serde(with = "serde_bytes")]
    pub bitfield: Vec<u8>,
    /// Per file records, in torrent file order.
    pub files: Vec<ResumeFile>,
    /// Compact peer addresses, 6 bytes each.
    #[serde(with = "serde_bytes")]
    pub peers: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct ResumeFile {
    /// The file's modification time when the record was saved, in seconds
    /// since the epoch.
    pub mtime: i64,
    /// The file's download priority (0 skip, 1 normal, 2 high).
    pub priority: u8,
}

/// The outer map holding the resume record under its well known key.
#[derive(Serialize, Deserialize)]
struct Wrapper {
    #[serde(rename = "libtorrent resume")]
    resume: ResumeData,
}

impl ResumeData {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(&Wrapper {
            resume: self.clone(),
        })
        .map_err(Into::into)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let wrapper: Wrapper = serde_bencode::from_bytes(buf)?;
        Ok(wrapper.resume)
    }

    /// Decodes the compact peer list. A trailing fragment shorter than an
    /// entry is ignored.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers
            .chunks_exact(COMPACT_ADDR_LEN)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect()
    }

    /// Encodes peer addresses into the compact form. Only IPv4 addresses
    /// are representable; others are skipped.
    pub fn set_peers<'a>(
        &mut self,
        peers: impl Iterator<Item = &'a SocketAddr>,
    ) {
        self.peers.clear();
        for peer in peers {
            if let SocketAddr::V4(addr) = peer {
                self.peers.extend_from_slice(&addr.ip().octets());
                self.peers.extend_from_slice(&addr.port().to_be_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_round_trip() {
        let mut resume = ResumeData {
            bitfield: vec![0b1010_1000],
            files: vec![
                ResumeFile {
                    mtime: 1_600_000_000,
                    priority: 1,
                },
                ResumeFile {
                    mtime: 1_600_000_500,
                    priority: 0,
                },
            ],
            peers: Vec::new(),
        };
        let peers: Vec<SocketAddr> = vec![
            "10.0.0.1:6881".parse().unwrap(),
            "192.168.1.20:51413".parse().unwrap(),
        ];
        resume.set_peers(peers.iter());

        let encoded = resume.to_bytes().unwrap();
        let decoded = ResumeData::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, resume);
        assert_eq!(decoded.peers(), peers);
    }

    #[test]
    fn test_compact_peer_encoding() {
        let mut resume = ResumeData {
            bitfield: Vec::new(),
            files: Vec::new(),
            peers: Vec::new(),
        };
        let peer: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        resume.set_peers(std::iter::once(&peer));
        assert_eq!(resume.peers, vec![1, 2, 3, 4, 0x1a, 0xe1]);
    }

    #[test]
    fn test_trailing_fragment_is_ignored() {
        let resume = ResumeData {
            bitfield: Vec::new(),
            files: Vec::new(),
            peers: vec![1, 2, 3, 4, 0x1a, 0xe1, 9, 9, 9],
        };
        assert_eq!(resume.peers().len(), 1);
    }

    #[test]
    fn test_missing_key_is_an_error() {
        assert!(ResumeData::from_bytes(b"de").is_err());
    }
}

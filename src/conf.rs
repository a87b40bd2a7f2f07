//! This module defines types used to configure the engine and its parts.

use std::{net::Ipv4Addr, ops::RangeInclusive, path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The default client id prefix, in the Azureus style: client tag and
/// version, completed with random digits at session start.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-rp0100-";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The first 8 bytes of the ID announced to trackers and other peers. The
    /// remaining 12 bytes are filled in randomly when the engine starts.
    pub client_id_prefix: [u8; 8],
    /// The range of ports the TCP listener tries to bind, in order. The first
    /// free port wins.
    pub listen_ports: RangeInclusive<u16>,
    /// The local address the listener binds to.
    pub bind_addr: Ipv4Addr,
    /// The most sockets the engine is willing to keep open, counting both
    /// established connections and in-progress handshakes. Incoming
    /// connections over this limit are refused.
    pub max_open_sockets: usize,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id_prefix: *CLIENT_ID_PREFIX,
            listen_ports: 6881..=6889,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            max_open_sockets: 512,
        }
    }
}

impl EngineConf {
    /// Generates the session's peer id from the configured prefix and random
    /// ASCII digits.
    pub fn generate_client_id(&self) -> PeerId {
        let mut id = [0; 20];
        id[..8].copy_from_slice(&self.client_id_prefix);
        let mut rng = rand::thread_rng();
        for b in id[8..].iter_mut() {
            *b = rng.gen_range(b'0'..=b'9');
        }
        id
    }
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it. Values outside their documented
/// ranges are clamped by [`TorrentConf::clamped`].
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The number of peers below which the torrent tries to open new
    /// connections from its available pool. Range 1-999.
    pub min_peers: usize,

    /// The max number of connected peers the torrent should have. Range
    /// 1-999.
    pub max_peers: usize,

    /// How many peers may be unchoked at a time, including the optimistic
    /// slot. Range 0-999.
    pub max_uploads: usize,

    /// How often the choker re-ranks peers. Range 10-3600 seconds.
    pub choke_cycle: Duration,

    /// How long to wait after opening the torrent before starting the
    /// on-disk piece check. Range 0-60 seconds.
    pub files_check_wait: Duration,

    /// Global download rate limit in bytes per second, 0 meaning unlimited.
    pub download_rate_limit: u64,

    /// Global upload rate limit in bytes per second, 0 meaning unlimited.
    pub upload_rate_limit: u64,

    /// If the tracker doesn't provide an announce interval, this is used.
    pub announce_interval: Duration,

    /// After this many consecutive failed announces, the torrent stops
    /// announcing to a tracker.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            min_peers: 40,
            max_peers: 100,
            max_uploads: 15,
            choke_cycle: Duration::from_secs(30),
            files_check_wait: Duration::from_secs(0),
            download_rate_limit: 0,
            upload_rate_limit: 0,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
        }
    }

    /// Returns the configuration with every value forced into its legal
    /// range.
    pub fn clamped(mut self) -> Self {
        self.min_peers = self.min_peers.max(1).min(999);
        self.max_peers = self.max_peers.max(self.min_peers).min(999);
        self.max_uploads = self.max_uploads.min(999);
        self.choke_cycle = clamp_duration(
            self.choke_cycle,
            Duration::from_secs(10),
            Duration::from_secs(3600),
        );
        self.files_check_wait = clamp_duration(
            self.files_check_wait,
            Duration::from_secs(0),
            Duration::from_secs(60),
        );
        self
    }
}

fn clamp_duration(d: Duration, min: Duration, max: Duration) -> Duration {
    d.max(min).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_from_prefix() {
        let conf = EngineConf::default();
        let id = conf.generate_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn test_conf_clamping() {
        let mut conf = TorrentConf::new("/tmp");
        conf.min_peers = 0;
        conf.max_peers = 10_000;
        conf.choke_cycle = Duration::from_secs(1);
        let conf = conf.clamped();
        assert_eq!(conf.min_peers, 1);
        assert_eq!(conf.max_peers, 999);
        assert_eq!(conf.choke_cycle, Duration::from_secs(10));
    }
}

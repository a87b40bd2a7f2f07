//! HTTP tracker announces.
//!
//! Trackers are organized in tiers (BEP 12): an announce walks the tiers in
//! order and the trackers within a tier in order, stopping at the first
//! success. The successful tracker is promoted to the front of its tier so
//! that a working tracker is tried first next time. Each individual request
//! is bounded by a timeout, after which the next tracker is tried.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_bencode::value::Value;
use thiserror::Error;
use url::Url;

use crate::{PeerId, Sha1Hash};

/// How long a single tracker request may take before the next tracker is
/// tried.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Byte strings in tracker requests are escaped preserving only unreserved
/// characters the original protocol kept: ASCII alphanumerics and '-'.
const URL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-');

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// The first announce of a session.
    Started,
    /// The download just finished.
    Completed,
    /// The torrent is shutting down. Sent best-effort, once.
    Stopped,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

/// The parameters of one announce request.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// A random session key letting the tracker recognize us across IP
    /// changes.
    pub key: u32,
    /// The port our listener accepts peer connections on.
    pub port: u16,
    /// Our externally visible address, if the caller knows better than the
    /// tracker would.
    pub ip: Option<Ipv4Addr>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    /// How many peers we'd like in the response.
    pub numwant: Option<usize>,
    pub event: Option<Event>,
}

/// A peer as returned by a tracker: always an address, and in the
/// non-compact response format possibly also the peer's id.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PeerEntry {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
}

#[derive(Debug)]
pub(crate) struct AnnounceResponse {
    /// How long the tracker wants us to wait before the next regular
    /// announce.
    pub interval: Option<Duration>,
    /// The lower bound on the announce interval, if given.
    pub min_interval: Option<Duration>,
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Error)]
pub(crate) enum TrackerError {
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker request timed out")]
    Timeout,

    #[error("invalid tracker response: {0}")]
    Response(&'static str),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("no trackers to announce to")]
    NoTrackers,
}

struct Tracker {
    url: Url,
    /// An id the tracker may hand out on the first announce, echoed back on
    /// subsequent ones.
    tracker_id: Option<String>,
}

impl Tracker {
    async fn announce(
        &mut self,
        client: &reqwest::Client,
        params: &Announce,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = self.build_url(params);
        log::debug!("Announcing to tracker {}", self.url);

        let request = async {
            let resp = client.get(&url).send().await?;
            resp.bytes().await
        };
        let body = tokio::time::timeout(ANNOUNCE_TIMEOUT, request)
            .await
            .map_err(|_| TrackerError::Timeout)??;

        let (response, tracker_id) = parse_response(&body)?;
        if tracker_id.is_some() {
            self.tracker_id = tracker_id;
        }
        Ok(response)
    }

    /// Assembles the announce URL. Byte string values are escaped with
    /// [`URL_ENCODE_SET`]; everything else is plain decimal, except the key
    /// which is canonically sent as 8 hex digits.
    fn build_url(&self, params: &Announce) -> String {
        use std::fmt::Write;

        let mut url = format!(
            "{url}{sep}info_hash={info_hash}&peer_id={peer_id}\
            &key={key:08x}&port={port}\
            &uploaded={uploaded}&downloaded={downloaded}&left={left}\
            &compact=1",
            url = self.url,
            sep = if self.url.query().is_some() { '&' } else { '?' },
            info_hash = percent_encode(&params.info_hash, URL_ENCODE_SET),
            peer_id = percent_encode(&params.peer_id, URL_ENCODE_SET),
            key = params.key,
            port = params.port,
            uploaded = params.uploaded,
            downloaded = params.downloaded,
            left = params.left,
        );
        if let Some(ip) = &params.ip {
            let _ = write!(url, "&ip={}", ip);
        }
        if let Some(numwant) = params.numwant {
            let _ = write!(url, "&numwant={}", numwant);
        }
        if let Some(tracker_id) = &self.tracker_id {
            let _ = write!(
                url,
                "&trackerid={}",
                percent_encode(tracker_id.as_bytes(), URL_ENCODE_SET)
            );
        }
        if let Some(event) = params.event {
            let _ = write!(url, "&event={}", event.as_str());
        }
        url
    }
}

pub(crate) struct TrackerGroup {
    client: reqwest::Client,
    tiers: Vec<Vec<Tracker>>,
    /// The message of the most recent announce failure, for the UI.
    last_error: Option<String>,
}

impl TrackerGroup {
    pub fn new(tiers: Vec<Vec<Url>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            tiers: tiers
                .into_iter()
                .map(|tier| {
                    tier.into_iter()
                        .map(|url| Tracker {
                            url,
                            tracker_id: None,
                        })
                        .collect()
                })
                .collect(),
            last_error: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(Vec::is_empty)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Announces to the first responding tracker, trying tiers and the
    /// trackers within them in order, and promotes the responder to the
    /// front of its tier.
    pub async fn announce(
        &mut self,
        params: Announce,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut last_error = TrackerError::NoTrackers;
        for tier in self.tiers.iter_mut() {
            for index in 0..tier.len() {
                match tier[index].announce(&self.client, &params).await {
                    Ok(response) => {
                        // move the responding tracker to the front of its
                        // tier
                        tier[..=index].rotate_right(1);
                        self.last_error = None;
                        return Ok(response);
                    }
                    Err(e) => {
                        log::warn!(
                            "Announce to {} failed: {}",
                            tier[index].url,
                            e
                        );
                        self.last_error = Some(e.to_string());
                        last_error = e;
                    }
                }
            }
        }
        Err(last_error)
    }
}

/// Parses a bencoded announce response into the response struct and the
/// optional tracker id.
fn parse_response(
    body: &[u8],
) -> Result<(AnnounceResponse, Option<String>), TrackerError> {
    let root: Value = serde_bencode::from_bytes(body)
        .map_err(|_| TrackerError::Response("not valid bencode"))?;
    let dict = match root {
        Value::Dict(dict) => dict,
        _ => return Err(TrackerError::Response("root not a map")),
    };

    if let Some(reason) = dict.get(&b"failure reason"[..]) {
        let reason = match reason {
            Value::Bytes(bytes) => {
                String::from_utf8_lossy(bytes).into_owned()
            }
            _ => "failure reason not a string".into(),
        };
        return Err(TrackerError::Failure(reason));
    }

    let interval = get_int(&dict, b"interval")
        .map(|secs| Duration::from_secs(secs.max(0) as u64));
    let min_interval = get_int(&dict, b"min interval")
        .map(|secs| Duration::from_secs(secs.max(0) as u64));

    let tracker_id = dict.get(&b"tracker id"[..]).and_then(|v| match v {
        Value::Bytes(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        _ => None,
    });

    let peers = match dict.get(&b"peers"[..]) {
        Some(Value::Bytes(bytes)) => parse_peers_compact(bytes),
        Some(Value::List(list)) => parse_peers_dict(list),
        Some(_) => {
            return Err(TrackerError::Response(
                "peers neither a string nor a list",
            ))
        }
        None => Vec::new(),
    };

    Ok((
        AnnounceResponse {
            interval,
            min_interval,
            peers,
        },
        tracker_id,
    ))
}

fn get_int(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(value)) => Some(*value),
        _ => None,
    }
}

/// Parses the compact peer format: 6 bytes per peer, a 4 byte IPv4 address
/// followed by a big endian port. A trailing fragment is ignored.
fn parse_peers_compact(bytes: &[u8]) -> Vec<PeerEntry> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerEntry {
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                id: None,
            }
        })
        .collect()
}

/// Parses the original peer list format: a list of maps with `ip`, `port`,
/// and optionally `peer id` keys. Entries that don't parse are skipped.
fn parse_peers_dict(list: &[Value]) -> Vec<PeerEntry> {
    list.iter()
        .filter_map(|entry| {
            let dict = match entry {
                Value::Dict(dict) => dict,
                _ => return None,
            };

            let ip: Ipv4Addr = match dict.get(&b"ip"[..]) {
                Some(Value::Bytes(bytes)) => {
                    std::str::from_utf8(bytes).ok()?.parse().ok()?
                }
                _ => return None,
            };
            let port = get_int(dict, b"port")?;
            if port < 0 || port > u16::MAX as i64 {
                return None;
            }

            let id = dict.get(&b"peer id"[..]).and_then(|v| match v {
                Value::Bytes(bytes) if bytes.len() == 20 => {
                    let mut id = [0; 20];
                    id.copy_from_slice(bytes);
                    Some(id)
                }
                _ => None,
            });

            Some(PeerEntry {
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port as u16)),
                id,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn params() -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"-rp0100-012345678901",
            key: 0xdead_beef,
            port: 6881,
            ip: None,
            uploaded: 512,
            downloaded: 1024,
            left: 2048,
            numwant: Some(50),
            event: Some(Event::Started),
        }
    }

    #[test]
    fn test_url_escaping_preserves_only_unreserved_bytes() {
        let tracker = Tracker {
            url: Url::parse("http://tracker.test/announce").unwrap(),
            tracker_id: None,
        };
        let url = tracker.build_url(&params());

        // every 0xab byte of the info hash is escaped
        assert!(url.contains(
            "info_hash=%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB%AB"
        ));
        // the alphanumerics and dashes of the peer id are not
        assert!(url.contains("peer_id=-rp0100-012345678901"));
        assert!(url.contains("key=deadbeef"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=50"));
        assert!(url.contains("&event=started"));
        assert!(url.contains("&left=2048"));
    }

    #[test]
    fn test_parse_compact_response() {
        let body =
            b"d8:intervali1800e12:min intervali900e5:peers6:\x01\x02\x03\x04\x1a\xe1e";
        let (response, tracker_id) = parse_response(&body[..]).unwrap();

        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.min_interval, Some(Duration::from_secs(900)));
        assert_eq!(tracker_id, None);
        assert_eq!(
            response.peers,
            vec![PeerEntry {
                addr: "1.2.3.4:6881".parse().unwrap(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_parse_dict_response() {
        let body = b"d8:intervali60e5:peersld2:ip7:1.2.3.44:porti6881e7:peer id20:abcdefghijklmnopqrstede2:ip3:bad4:porti1eee";
        let (response, _) = parse_response(&body[..]).unwrap();

        // the malformed second entry is skipped
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr, "1.2.3.4:6881".parse::<SocketAddr>().unwrap());
        assert_eq!(response.peers[0].id, Some(*b"abcdefghijklmnopqrst"));
    }

    #[test]
    fn test_failure_reason_is_an_error() {
        let body = b"d14:failure reason9:not founde";
        match parse_response(&body[..]) {
            Err(TrackerError::Failure(reason)) => {
                assert_eq!(reason, "not found")
            }
            other => panic!("expected failure, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_announce_and_promotion() {
        // the first tracker fails, the second responds; afterwards the
        // responder must be at the front of the tier
        let failing = mockito::mock("GET", mockito::Matcher::Regex("/bad.*".into()))
            .with_status(500)
            .create();
        let working = mockito::mock("GET", mockito::Matcher::Regex("/good.*".into()))
            .with_body(&b"d8:intervali1800e5:peers6:\x01\x02\x03\x04\x1a\xe1e"[..])
            .create();

        let base = mockito::server_url();
        let mut group = TrackerGroup::new(vec![vec![
            Url::parse(&format!("{}/bad", base)).unwrap(),
            Url::parse(&format!("{}/good", base)).unwrap(),
        ]]);

        let response = group.announce(params()).await.unwrap();
        assert_eq!(response.peers.len(), 1);
        assert!(group.last_error().is_none());
        assert!(group.tiers[0][0].url.path().starts_with("/good"));

        failing.assert();
        working.assert();
    }

    #[tokio::test]
    async fn test_all_trackers_failing_returns_last_error() {
        let _failing =
            mockito::mock("GET", mockito::Matcher::Regex("/bad.*".into()))
                .with_body(&b"d14:failure reason7:no dicee"[..])
                .create();

        let base = mockito::server_url();
        let mut group = TrackerGroup::new(vec![vec![Url::parse(&format!(
            "{}/bad",
            base
        ))
        .unwrap()]]);

        assert!(group.announce(params()).await.is_err());
        assert!(group.last_error().is_some());
    }
}

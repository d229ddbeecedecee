use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_encode};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::{
    metainfo::TorrentFile,
    peer::Peer,
    types::{PeerId, Sha1Hash},
};

pub(crate) type Result<T> = std::result::Result<T, TrackerError>;

// Everything outside the RFC 3986 unreserved set is escaped.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Failed to parse announce URL")]
    InvalidAnnounce(#[from] url::ParseError),

    #[error("Tracker is unreachable")]
    Unreachable(#[from] reqwest::Error),

    #[error("Tracker responded with status {0}")]
    Status(StatusCode),

    #[error("Tracker response is malformed: {0}")]
    ProtocolViolation(#[from] ResponseError),

    #[error("Tracker refused the announce: {0}")]
    Failure(String),

    #[error("Received invalid peers string of length {0}")]
    InvalidPeerList(usize),
}

/// Why a tracker response could not be understood.
#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("not valid bencode")]
    Bencode(#[from] serde_bencode::Error),

    #[error("missing `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    // Upper bound for the whole announce, connect included.
    pub timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    // Seconds the tracker wants us to wait before the next announce.
    pub interval: u64,
    pub peers: Vec<Peer>,
}

// Use to request peers from the tracker from the metainfo announce
// https://bittorrent.org/beps/bep_0003.html#trackers
#[derive(Debug, Clone)]
pub struct Tracker {
    client: Client,
}

mod raw {
    use serde::Deserialize;
    use serde_bytes::ByteBuf;

    #[derive(Debug, Deserialize)]
    pub struct Response {
        #[serde(rename = "failure reason")]
        pub failure_reason: Option<String>,
        pub interval: Option<u64>,
        // Only the compact form is requested, see BEP 23.
        pub peers: Option<ByteBuf>,
    }
}

/// Builds the announce URL for `torrent`, identifying ourselves as `peer_id`
/// listening on `port`.
pub fn build_announce_url(torrent: &TorrentFile, peer_id: &PeerId, port: u16) -> Result<Url> {
    announce_url(
        torrent.announce(),
        torrent.info_hash(),
        peer_id,
        port,
        torrent.info().length,
    )
}

fn announce_url(
    announce: &str,
    info_hash: &Sha1Hash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Result<Url> {
    let mut url = Url::parse(announce)?;

    let info_hash = percent_encode(info_hash, URL_ENCODE_RESERVED).to_string();
    let peer_id = percent_encode(peer_id, URL_ENCODE_RESERVED).to_string();
    let params = [
        ("compact", "1".to_string()),
        ("downloaded", "0".to_string()),
        ("info_hash", info_hash),
        ("left", left.to_string()),
        ("peer_id", peer_id),
        ("port", port.to_string()),
        ("uploaded", "0".to_string()),
    ];
    let announce_query = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");

    // Values are already escaped, so the query is set verbatim rather than
    // going through `query_pairs_mut` which would escape the `%` again.
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, announce_query),
        _ => announce_query,
    };
    url.set_query(Some(&query));
    Ok(url)
}

impl Tracker {
    pub fn new() -> Result<Self> {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client })
    }

    pub async fn announce(
        &self,
        torrent: &TorrentFile,
        peer_id: &PeerId,
        port: u16,
    ) -> Result<AnnounceResponse> {
        let url = build_announce_url(torrent, peer_id, port)?;
        log::debug!(
            "announcing {} to {}",
            torrent.info_hash_hex(),
            url.host_str().unwrap_or_default()
        );

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        let resp = match serde_bencode::from_bytes::<raw::Response>(&body) {
            Ok(resp) => resp,
            Err(_) if !status.is_success() => return Err(TrackerError::Status(status)),
            Err(e) => return Err(ResponseError::Bencode(e).into()),
        };
        if let Some(reason) = resp.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        if !status.is_success() {
            return Err(TrackerError::Status(status));
        }

        let interval = resp.interval.ok_or(ResponseError::MissingField("interval"))?;
        let peers = resp.peers.ok_or(ResponseError::MissingField("peers"))?;
        let peers = Peer::parse_compact(&peers)?;
        log::debug!("tracker returned {} peers, interval {}s", peers.len(), interval);

        Ok(AnnounceResponse { interval, peers })
    }

    pub async fn request_peers(
        &self,
        torrent: &TorrentFile,
        peer_id: &PeerId,
        port: u16,
    ) -> Result<Vec<Peer>> {
        Ok(self.announce(torrent, peer_id, port).await?.peers)
    }
}

/// Announces once with the default configuration and returns the peers.
pub async fn request_peers(torrent: &TorrentFile, peer_id: &PeerId, port: u16) -> Result<Vec<Peer>> {
    Tracker::new()?.request_peers(torrent, peer_id, port).await
}

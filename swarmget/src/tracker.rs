use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::de;
use url::Url;

use crate::{error::BencodeError, PeerId, Sha1Hash};

pub use reqwest::Error as HttpError;

pub(crate) type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// The possible errors that may occur when contacting the tracker.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// The response was not valid bencode or had unexpected fields.
    Bencode(BencodeError),
    /// HTTP related errors when contacting the tracker.
    Http(HttpError),
    /// The tracker rejected the announce, with this reason.
    Failure(String),
}

impl From<BencodeError> for TrackerError {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<HttpError> for TrackerError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::Failure(reason) => write!(f, "tracker failure: {}", reason),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bencode(e) => Some(e),
            Self::Http(e) => Some(e),
            Self::Failure(_) => None,
        }
    }
}

/// Parameters for announcing to a tracker.
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which we are listening. We don't accept connections, but
    /// trackers require the field.
    pub port: u16,
    /// Number of bytes downloaded so far.
    pub downloaded: u64,
    /// Number of bytes uploaded so far.
    pub uploaded: u64,
    /// Number of bytes left to download.
    pub left: u64,
    /// The number of peers we'd like to receive. If omitted, the tracker picks
    /// a default, typically between 30 and 50.
    pub peer_count: Option<usize>,
    /// Only need be set during the special events defined in [`Event`].
    /// Otherwise when just requesting peers, no event needs to be set.
    pub event: Option<Event>,
}

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// The first request to tracker must include this value.
    Started,
    /// Must be sent to the tracker when the download completes.
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

/// The tracker announce response.
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct Response {
    /// If this is not empty, no other fields in response are valid. It contains
    /// a human-readable error message as to why the request was invalid.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    /// Similar to failure_reason, but the response is still processed.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    /// The number of seconds the client should wait before recontacting tracker.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub interval: Option<Duration>,

    /// If present, the client must not reannounce itself before the end of this
    /// interval.
    #[serde(default)]
    #[serde(rename = "min interval")]
    #[serde(deserialize_with = "deserialize_seconds")]
    pub min_interval: Option<Duration>,

    #[serde(rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    pub leecher_count: Option<usize>,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

/// The HTTP tracker of a torrent, from which we request peers.
pub(crate) struct Tracker {
    client: Client,
    url: Url,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    /// Sends an announce request to the tracker with the specified parameters
    /// and returns its response.
    ///
    /// A response with a failure reason is turned into
    /// [`TrackerError::Failure`], while a warning is only logged.
    pub async fn announce(&self, params: Announce) -> Result<Response> {
        // announce parameters are built up in the query string, see:
        // https://www.bittorrent.org/beps/bep_0003.html trackers section
        let mut query = vec![
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            // each peer takes up only 6 bytes in the compact response, and
            // many trackers send it regardless of this flag
            ("compact", "1".to_string()),
        ];
        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }
        if let Some(event) = params.event {
            query.push(("event", event.as_str().to_string()));
        }

        // the info hash and peer id are raw bytes that reqwest's query
        // serializer can't encode without requiring valid utf8, so they are
        // percent encoded by hand and placed in the url string directly
        let url = format!(
            "{url}?info_hash={info_hash}&peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encoding::percent_encode(
                &params.info_hash,
                URL_ENCODE_RESERVED
            ),
            peer_id = percent_encoding::percent_encode(
                &params.peer_id,
                URL_ENCODE_RESERVED
            ),
        );

        log::debug!("Announcing to tracker {}", self);
        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let resp: Response = serde_bencode::from_bytes(&resp)?;

        if let Some(reason) = resp.failure_reason {
            log::warn!("Tracker {} announce failed: {}", self, reason);
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &resp.warning_message {
            log::warn!("Tracker {} warning: {}", self, warning);
        }
        log::info!(
            "Tracker {} returned {} peer(s) (seeds: {:?}, leeches: {:?})",
            self,
            resp.peers.len(),
            resp.seeder_count,
            resp.leecher_count
        );
        Ok(resp)
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}'", self.url)
    }
}

/// Peers can be sent in two ways: as a bencoded list of dicts including full
/// peer metadata, or as a single bencoded string that contains only the peer IP
/// and port (compact representation). This helper deserializes both into a
/// list of addresses, discarding the peer id of the full representation, as
/// the handshake tells us the peer's id anyway.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or list of dicts representing peers")
        }

        /// Deserializes a compact string of peers.
        ///
        /// Each entry is 6 bytes long, where the first 4 bytes are the IPv4
        /// address of the peer, and the last 2 bytes are the port of the peer.
        /// Both are in network byte order.
        fn visit_bytes<E>(self, mut b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;
            if b.len() % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers compact string must be a multiple of 6",
                ));
            }

            let mut peers = Vec::with_capacity(b.len() / ENTRY_LEN);
            while b.has_remaining() {
                let ip = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        /// Deserializes a list of dicts containing the peer information.
        /// Entries whose IP doesn't parse are skipped.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                match ip.parse() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, port)),
                    Err(_) => log::debug!("Skipping peer with invalid ip {}", ip),
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Deserializes an integer representing seconds into a `Duration`.
fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s: Option<u64> = de::Deserialize::deserialize(deserializer)?;
    Ok(s.map(Duration::from_secs))
}

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

//! The tracker announce client, as seen by the engine: something that takes
//! announce parameters and returns an interval and a batch of peer
//! addresses.
//!
//! The transfer supervisor only depends on the [`Announcer`] trait, so tests
//! and alternative transports can stand in for the bundled HTTP client.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use futures::future::BoxFuture;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use url::Url;

use crate::{error::*, PeerId, Sha1Hash};

/// The announce event, telling the tracker where in its lifecycle the
/// transfer is. Regular periodic announces carry no event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The first announce of the transfer.
    Started,
    /// Sent exactly once, when the download completes.
    Completed,
    /// The final announce, at shutdown.
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

/// The parameters of a single announce.
#[derive(Clone, Debug)]
pub struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we could accept connections on. Advertised even though the
    /// engine does not currently listen.
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// What the tracker answered: when to announce next and whom to try.
#[derive(Clone, Debug, Default)]
pub struct Response {
    /// The tracker's requested announce interval. The supervisor clamps it
    /// to its configured bounds.
    pub interval: Option<Duration>,
    /// Candidate peer addresses for the torrent.
    pub peers: Vec<SocketAddr>,
}

/// A source of announce responses. Object-safe so the supervisor can hold a
/// heterogeneous set of trackers.
pub trait Announcer: Send + Sync {
    fn announce(
        &self,
        params: AnnounceParams,
    ) -> BoxFuture<'_, Result<Response>>;
}

/// The standard HTTP(S) announce client.
pub struct HttpTracker {
    client: reqwest::Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    fn announce_url(&self, params: &AnnounceParams) -> Url {
        let mut url = self.url.clone();
        // the info hash and peer id are raw bytes and must be percent
        // encoded by hand; reqwest's query builder would utf-8 mangle them
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&downloaded={}&uploaded={}\
             &left={}&compact=1",
            percent_encode(&params.info_hash, NON_ALPHANUMERIC),
            percent_encode(&params.peer_id, NON_ALPHANUMERIC),
            params.port,
            params.downloaded,
            params.uploaded,
            params.left,
        );
        if let Some(event) = params.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        let full_query = match url.query() {
            Some(existing) => format!("{}&{}", existing, query),
            None => query,
        };
        url.set_query(Some(&full_query));
        url
    }
}

impl Announcer for HttpTracker {
    fn announce(
        &self,
        params: AnnounceParams,
    ) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let url = self.announce_url(&params);
            log::debug!("Announcing to tracker: {}", url);
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Tracker(e.to_string()))?;
            let body = resp
                .bytes()
                .await
                .map_err(|e| Error::Tracker(e.to_string()))?;
            parse_response(&body)
        })
    }
}

/// Parses a bencoded announce response, in either the compact (BEP 23) or
/// the original dictionary peer list format.
fn parse_response(body: &[u8]) -> Result<Response> {
    use serde_bencode::value::Value;

    let value: Value = serde_bencode::from_bytes(body)
        .map_err(|e| Error::Tracker(format!("bencode: {}", e)))?;
    let dict = match value {
        Value::Dict(dict) => dict,
        _ => return Err(Error::Tracker("response is not a dict".into())),
    };

    if let Some(Value::Bytes(reason)) = dict.get(&b"failure reason"[..]) {
        return Err(Error::Tracker(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let interval = match dict.get(&b"interval"[..]) {
        Some(Value::Int(secs)) if *secs > 0 => {
            Some(Duration::from_secs(*secs as u64))
        }
        _ => None,
    };

    let peers = match dict.get(&b"peers"[..]) {
        // compact format: 6 bytes per peer, 4 byte IPv4 + 2 byte port, all
        // big endian
        Some(Value::Bytes(bytes)) => {
            if bytes.len() % 6 != 0 {
                return Err(Error::Tracker(
                    "compact peer list not a multiple of 6 bytes".into(),
                ));
            }
            bytes
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    );
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::new(IpAddr::V4(ip), port)
                })
                .collect()
        }
        // the original format: a list of dicts with "ip" and "port" keys
        Some(Value::List(list)) => {
            let mut peers = Vec::with_capacity(list.len());
            for entry in list {
                let dict = match entry {
                    Value::Dict(dict) => dict,
                    _ => continue,
                };
                let ip = match dict.get(&b"ip"[..]) {
                    Some(Value::Bytes(ip)) => {
                        match String::from_utf8_lossy(ip).parse::<IpAddr>() {
                            Ok(ip) => ip,
                            Err(_) => continue,
                        }
                    }
                    _ => continue,
                };
                let port = match dict.get(&b"port"[..]) {
                    Some(Value::Int(port)) => *port as u16,
                    _ => continue,
                };
                peers.push(SocketAddr::new(ip, port));
            }
            peers
        }
        _ => Vec::new(),
    };

    Ok(Response { interval, peers })
}

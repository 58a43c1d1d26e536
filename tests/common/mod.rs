//! Shared helpers for the end-to-end tests: deterministic payloads, piece
//! hashing, an in-process "seed" that speaks the peer wire protocol over
//! real TCP sockets, and a recording tracker.

#![allow(dead_code)]

use std::{
    convert::TryInto,
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use freshet::{
    conf::Conf,
    error::Result,
    tracker::{AnnounceParams, Announcer, Event, Response},
};

pub const BLOCK_LEN: u32 = 0x4000;

/// A deterministic, non-repeating payload.
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let i = i as u64;
            (i.wrapping_mul(31).wrapping_add(i >> 8) & 0xff) as u8
        })
        .collect()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hash = [0; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

/// The concatenated piece hashes of a payload.
pub fn piece_hashes(data: &[u8], piece_len: u32) -> Vec<u8> {
    let mut hashes = Vec::new();
    for piece in data.chunks(piece_len as usize) {
        hashes.extend_from_slice(&sha1(piece));
    }
    hashes
}

/// A test configuration rooted in the given directory, with announce
/// intervals short enough for tests.
pub fn test_conf(dir: &Path) -> Conf {
    let mut conf = Conf::new(dir);
    conf.torrent.min_announce_interval = Duration::from_millis(100);
    conf
}

/// How a fake seed behaves once the availability exchange is done.
#[derive(Clone)]
pub enum SeedBehavior {
    /// Serves every request correctly.
    Honest,
    /// Serves every request with the first byte of the block flipped.
    Corrupt,
    /// Accepts `after_requests` requests without answering, chokes, pauses,
    /// unchokes, and serves honestly from then on.
    ChokeThenServe {
        after_requests: usize,
        pause: Duration,
    },
    /// Closes the connection upon receiving the n-th request, without
    /// answering it.
    DropOnRequest(usize),
}

/// A minimal in-process seed. It accepts any number of sequential
/// connections, performs the handshake, advertises all pieces, unchokes,
/// and then acts out its configured behavior.
pub struct FakeSeed {
    pub addr: SocketAddr,
    /// Total REQUEST messages received across all connections.
    pub requests_seen: Arc<AtomicUsize>,
    /// Number of connections that have ended.
    pub closed_conns: Arc<AtomicUsize>,
}

pub async fn spawn_seed(
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_len: u32,
    data: Vec<u8>,
    behavior: SeedBehavior,
) -> FakeSeed {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests_seen = Arc::new(AtomicUsize::new(0));
    let closed_conns = Arc::new(AtomicUsize::new(0));

    let seed = FakeSeed {
        addr,
        requests_seen: Arc::clone(&requests_seen),
        closed_conns: Arc::clone(&closed_conns),
    };

    tokio::spawn(async move {
        let data = Arc::new(data);
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let data = Arc::clone(&data);
            let behavior = behavior.clone();
            let requests_seen = Arc::clone(&requests_seen);
            let closed_conns = Arc::clone(&closed_conns);
            tokio::spawn(async move {
                let _ = serve_conn(
                    stream,
                    info_hash,
                    peer_id,
                    piece_len,
                    &data,
                    behavior,
                    &requests_seen,
                )
                .await;
                closed_conns.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    seed
}

async fn serve_conn(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_len: u32,
    data: &[u8],
    behavior: SeedBehavior,
    requests_seen: &AtomicUsize,
) -> std::io::Result<()> {
    // handshake
    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).await?;
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    assert_eq!(&handshake[28..48], &info_hash);

    let mut reply = [0u8; 68];
    reply[0] = 19;
    reply[1..20].copy_from_slice(b"BitTorrent protocol");
    reply[28..48].copy_from_slice(&info_hash);
    reply[48..68].copy_from_slice(&peer_id);
    stream.write_all(&reply).await?;

    // bitfield: we have everything
    let piece_count =
        (data.len() + piece_len as usize - 1) / piece_len as usize;
    let mut bitfield = vec![0u8; (piece_count + 7) / 8];
    for index in 0..piece_count {
        bitfield[index / 8] |= 0x80 >> (index % 8);
    }
    write_msg(&mut stream, 5, &bitfield).await?;
    // unchoke straight away
    write_msg(&mut stream, 1, &[]).await?;

    let mut choked_yet = false;
    loop {
        let (id, payload) = read_msg(&mut stream).await?;
        if id != Some(6) {
            // everything except REQUEST is ignored
            continue;
        }
        let seen = requests_seen.fetch_add(1, Ordering::SeqCst) + 1;
        let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        let len = u32::from_be_bytes(payload[8..12].try_into().unwrap());

        match &behavior {
            SeedBehavior::Honest => {
                serve_block(&mut stream, data, piece_len, index, begin, len, false)
                    .await?;
            }
            SeedBehavior::Corrupt => {
                serve_block(&mut stream, data, piece_len, index, begin, len, true)
                    .await?;
            }
            SeedBehavior::ChokeThenServe {
                after_requests,
                pause,
            } => {
                if choked_yet {
                    serve_block(
                        &mut stream,
                        data,
                        piece_len,
                        index,
                        begin,
                        len,
                        false,
                    )
                    .await?;
                } else if seen >= *after_requests {
                    // the requests so far go unanswered
                    choked_yet = true;
                    write_msg(&mut stream, 0, &[]).await?;
                    time::sleep(*pause).await;
                    write_msg(&mut stream, 1, &[]).await?;
                }
            }
            SeedBehavior::DropOnRequest(nth) => {
                if seen >= *nth {
                    return Ok(());
                }
                serve_block(&mut stream, data, piece_len, index, begin, len, false)
                    .await?;
            }
        }
    }
}

async fn serve_block(
    stream: &mut TcpStream,
    data: &[u8],
    piece_len: u32,
    index: u32,
    begin: u32,
    len: u32,
    corrupt: bool,
) -> std::io::Result<()> {
    let offset = index as usize * piece_len as usize + begin as usize;
    let mut block = data[offset..offset + len as usize].to_vec();
    if corrupt {
        block[0] ^= 0xff;
    }
    let mut payload = Vec::with_capacity(8 + block.len());
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&block);
    write_msg(stream, 7, &payload).await
}

/// Reads one framed message; `None` id means keep-alive.
pub async fn read_msg(
    stream: &mut TcpStream,
) -> std::io::Result<(Option<u8>, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok((None, Vec::new()));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let id = payload.remove(0);
    Ok((Some(id), payload))
}

pub async fn write_msg(
    stream: &mut TcpStream,
    id: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await
}

/// A tracker test double: returns a fixed peer list and records every
/// announce event it sees.
pub struct RecordingTracker {
    peers: Vec<SocketAddr>,
    events: Mutex<Vec<Option<Event>>>,
}

impl RecordingTracker {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, event: Event) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| **seen == Some(event))
            .count()
    }
}

impl Announcer for RecordingTracker {
    fn announce(
        &self,
        params: AnnounceParams,
    ) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            self.events.lock().unwrap().push(params.event);
            Ok(Response {
                interval: Some(Duration::from_millis(200)),
                peers: self.peers.clone(),
            })
        })
    }
}

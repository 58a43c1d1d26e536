//! The top level engine: client identity, torrent startup, and the download
//! handle the library user interacts with.

use std::{net::SocketAddr, sync::Arc};

use rand::Rng;
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};

use crate::{
    conf::{Conf, CLIENT_ID_PREFIX},
    error::*,
    metainfo::Metainfo,
    torrent::{Shared, Torrent},
    tracker::{Announcer, HttpTracker},
    PeerId, PieceIndex,
};

pub use crate::torrent::Alert;

/// The engine drives any number of torrent downloads under one client
/// identity and configuration.
pub struct Engine {
    conf: Conf,
    client_id: PeerId,
}

impl Engine {
    /// Creates an engine. If the configuration does not pin a client id, a
    /// process-wide one is generated on first use.
    pub fn new(conf: Conf) -> Self {
        let client_id =
            conf.engine.client_id.unwrap_or_else(process_client_id);
        Self { conf, client_id }
    }

    /// The peer id announced to trackers and peers.
    pub fn client_id(&self) -> PeerId {
        self.client_id
    }

    /// Starts downloading a torrent, announcing to the tracker in its
    /// metainfo (if it has a supported one).
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self, metainfo: &Metainfo) -> Result<Download> {
        let mut trackers: Vec<Arc<dyn Announcer>> = Vec::new();
        if let Some(announce) = &metainfo.announce {
            match url::Url::parse(announce) {
                Ok(url)
                    if url.scheme() == "http"
                        || url.scheme() == "https" =>
                {
                    trackers.push(Arc::new(HttpTracker::new(url)));
                }
                Ok(url) => {
                    log::warn!(
                        "Announce URL scheme {} not supported, \
                         relying on injected peers",
                        url.scheme()
                    );
                }
                Err(e) => {
                    log::warn!("Invalid announce URL: {}", e);
                }
            }
        }
        self.start_with_trackers(metainfo, trackers)
    }

    /// Starts downloading a torrent with an explicit set of trackers, which
    /// may be empty: peer addresses can also be injected through the
    /// download handle.
    pub fn start_with_trackers(
        &self,
        metainfo: &Metainfo,
        trackers: Vec<Arc<dyn Announcer>>,
    ) -> Result<Download> {
        let (torrent, shared, peer_chan, alert_port) = Torrent::new(
            self.conf.torrent.clone(),
            self.client_id,
            metainfo,
            trackers,
        )?;
        let finished = shared.finished.subscribe();
        let join = tokio::spawn(torrent.run());
        Ok(Download {
            shared,
            peer_chan,
            alert_port,
            finished,
            join,
        })
    }
}

/// Returns the process-wide client id, generating it on first use: the
/// fixed client prefix followed by random digits.
fn process_client_id() -> PeerId {
    use std::sync::OnceLock;
    static ID: OnceLock<PeerId> = OnceLock::new();
    *ID.get_or_init(|| {
        let mut id = [0u8; 20];
        id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
        let mut rng = rand::thread_rng();
        for byte in id[CLIENT_ID_PREFIX.len()..].iter_mut() {
            *byte = rng.gen_range(b'0'..=b'9');
        }
        log::info!("Generated client id {}", String::from_utf8_lossy(&id));
        id
    })
}

/// A snapshot of the transfer's progress.
#[derive(Clone, Copy, Debug)]
pub struct Stats {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// How many of them are verified and on disk.
    pub have_count: usize,
    /// The number of connected peers.
    pub peer_count: usize,
    /// Downloaded payload bytes (including corrupt and duplicate data).
    pub downloaded: u64,
    /// Payload bytes downloaded in the last one second round.
    pub download_rate: u64,
}

/// A handle to a running torrent download.
pub struct Download {
    shared: Arc<Shared>,
    peer_chan: UnboundedSender<Vec<SocketAddr>>,
    alert_port: UnboundedReceiver<Alert>,
    finished: watch::Receiver<bool>,
    join: JoinHandle<Result<()>>,
}

impl Download {
    /// Injects candidate peer addresses into the transfer, alongside
    /// whatever the trackers return.
    pub fn add_peers(&self, addrs: Vec<SocketAddr>) {
        let _ = self.peer_chan.send(addrs);
    }

    /// The next engine alert, or `None` once the transfer is gone.
    pub async fn next_alert(&mut self) -> Option<Alert> {
        self.alert_port.recv().await
    }

    /// Resolves once every piece is verified and on disk.
    pub async fn wait_finished(&mut self) -> Result<()> {
        while !*self.finished.borrow() {
            self.finished.changed().await.map_err(|_| Error::Channel)?;
        }
        Ok(())
    }

    /// A snapshot of the transfer's progress.
    pub async fn stats(&self) -> Stats {
        let state = self.shared.state.lock().await;
        Stats {
            piece_count: state.pieces.len(),
            have_count: state.own_pieces.count_ones(),
            peer_count: state.peers.len(),
            downloaded: state.downloaded.total(),
            download_rate: state.downloaded.rate(),
        }
    }

    /// Which pieces are verified and on disk.
    pub async fn have_pieces(&self) -> Vec<PieceIndex> {
        let state = self.shared.state.lock().await;
        state.own_pieces.iter_ones().collect()
    }

    /// Stops the transfer: peers are disconnected, a final stopped announce
    /// is sent, and the resume state is saved if configured.
    pub async fn shutdown(self) -> Result<()> {
        self.shared.stop.send_replace(true);
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                if e.is_panic() {
                    log::error!("Torrent task panicked: {:?}", e);
                }
                Err(Error::Channel)
            }
        }
    }
}

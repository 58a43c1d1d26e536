//! The transfer supervisor of a single torrent: it owns the piece table and
//! the peer table behind the transfer-wide mutex, consumes candidate peer
//! addresses, dials and supervises peer sessions, and runs the writer pool
//! that turns assembled pieces into verified bytes on disk.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use futures::FutureExt;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch, Semaphore,
    },
    task,
    time::{self, Instant},
};
use url::Url;

use crate::{
    conf::TorrentConf,
    counter::ThruputCounter,
    disk::{self, TorrentFiles},
    error::*,
    metainfo::Metainfo,
    peer::{self, Message, PeerSession},
    piece::Piece,
    storage::StorageInfo,
    sync::CondMutex,
    tracker::{AnnounceParams, Announcer, Event},
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

/// The port advertised to trackers. The engine does not currently listen for
/// inbound connections.
const ANNOUNCE_PORT: u16 = 6881;

/// Identifies who produced a piece buffer handed to the writer pool.
/// Consumed only for attributing hash failures.
#[derive(Clone, Debug)]
pub(crate) enum Source {
    /// The peer that delivered the final block of the piece.
    Peer(PeerId),
    /// A webseed HTTP server. The variant is carried so strike accounting
    /// has a place for it once the webseed download path exists.
    #[allow(dead_code)]
    Webseed(Url),
    /// The piece was read back from disk during resume verification. Never
    /// written, and a mismatch is stale data rather than an offense.
    Resume,
}

/// A fully assembled piece on its way to verification and disk.
pub(crate) struct PieceWrite {
    pub index: PieceIndex,
    pub data: Vec<u8>,
    pub source: Source,
}

/// Events surfaced to the library user through the download handle.
#[derive(Debug)]
#[non_exhaustive]
pub enum Alert {
    /// A piece was downloaded, verified and written to disk.
    PieceCompleted { index: PieceIndex },
    /// All pieces are verified and on disk.
    TransferComplete,
    /// A disk write failed; the transfer is paused. Peers stay connected but
    /// no further requests are issued.
    DiskFailure { error: String },
}

/// A connected peer, as seen by the rest of the engine.
///
/// Lives in the peer table of [`TransferState`]; all fields are guarded by
/// the transfer mutex. Removal from the table is what "disconnected" means:
/// tasks holding the peer's id observe the missing entry and wind down.
pub(crate) struct PeerHandle {
    pub addr: SocketAddr,
    /// Which pieces the peer claims to have, per its bitfield and have
    /// messages.
    pub pieces: Bitfield,
    /// We never stop choking the peer: the seeding half is a stub.
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// How many corrupt pieces this peer has delivered.
    pub strikes: u8,
    /// The reserved bytes from the peer's handshake, retained but not
    /// interpreted.
    #[allow(dead_code)]
    pub reserved: [u8; 8],
    /// The peer's write queue. Messages sent here reach the wire in order.
    pub msg_chan: UnboundedSender<Message>,
    /// For telling the session to shut down (e.g. on a strike-out).
    pub cmd_chan: UnboundedSender<peer::Command>,
}

impl PeerHandle {
    /// A fresh handle with the protocol flags at their birth values: both
    /// sides choking, neither side interested.
    pub fn new(
        addr: SocketAddr,
        piece_count: usize,
        reserved: [u8; 8],
        msg_chan: UnboundedSender<Message>,
        cmd_chan: UnboundedSender<peer::Command>,
    ) -> Self {
        Self {
            addr,
            pieces: Bitfield::repeat(false, piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            strikes: 0,
            reserved,
            msg_chan,
            cmd_chan,
        }
    }
}

/// Everything the transfer's tasks share under the one transfer mutex.
pub(crate) struct TransferState {
    /// The per-piece descriptors: hash, availability, request marks.
    pub pieces: Vec<Piece>,
    /// The pieces we have verified on disk.
    pub own_pieces: Bitfield,
    /// The connected peers, keyed by their wire id.
    pub peers: HashMap<PeerId, PeerHandle>,
    /// The addresses currently being dialed or connected, to avoid
    /// duplicate sessions to the same peer.
    pub connected_addrs: HashSet<SocketAddr>,
    /// Addresses that committed a protocol violation and when their
    /// back-off window ends.
    pub banned_addrs: HashMap<SocketAddr, Instant>,
    /// The transfer's own random generator, used for picker tie-breaks.
    pub rng: StdRng,
    /// Latched true when the last piece lands; the one-shot finished signal
    /// fires at the same moment.
    pub finished: bool,
    /// Set on a disk write failure. Downloaders stop issuing requests until
    /// the transfer is stopped (or a future unpause operation clears it).
    pub io_paused: bool,
    /// Downloaded payload bytes.
    pub downloaded: ThruputCounter,
}

/// The handles every task of the transfer shares.
pub(crate) struct Shared {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
    /// The transfer mutex and its condition variable.
    pub state: CondMutex<TransferState>,
    /// The input of the writer pool.
    pub write_queue: UnboundedSender<PieceWrite>,
    /// The transfer-wide stop signal, observed at every suspension point.
    pub stop: watch::Sender<bool>,
    /// The one-shot finished signal: flipped to true exactly once, when the
    /// local bitfield fills up.
    pub finished: watch::Sender<bool>,
    /// Alerts to the library user. Send failures mean the user dropped the
    /// handle and are ignored.
    pub alert_chan: UnboundedSender<Alert>,
}

impl Shared {
    /// Assembles the announce parameters from the current transfer state.
    pub async fn announce_params(
        &self,
        event: Option<Event>,
    ) -> AnnounceParams {
        let state = self.state.lock().await;
        let left: u64 = state
            .pieces
            .iter()
            .filter(|piece| !piece.have)
            .map(|piece| piece.len as u64)
            .sum();
        AnnounceParams {
            info_hash: self.info_hash,
            peer_id: self.client_id,
            port: ANNOUNCE_PORT,
            downloaded: state.downloaded.total(),
            uploaded: 0,
            left,
            event,
        }
    }
}

/// The supervisor itself. Constructed by the engine, run as a task.
pub(crate) struct Torrent {
    shared: Arc<Shared>,
    files: Arc<TorrentFiles>,
    trackers: Vec<Arc<dyn Announcer>>,
    /// The address intake: trackers (and the library user) push candidate
    /// peer address batches here. Handed to the announce loops at startup
    /// and dropped, so the intake closes once every sender is gone.
    peer_chan: Option<UnboundedSender<Vec<SocketAddr>>>,
    peer_port: UnboundedReceiver<Vec<SocketAddr>>,
    /// Taken by the writer pool task at startup.
    write_port: Option<UnboundedReceiver<PieceWrite>>,
}

impl Torrent {
    /// Sets up a transfer: allocates the piece table, opens the backing
    /// files, and wires up the channels.
    ///
    /// Returns the supervisor plus the pieces the engine hands to the
    /// download handle: the shared state, the address intake, and the alert
    /// port.
    pub fn new(
        conf: TorrentConf,
        client_id: PeerId,
        metainfo: &Metainfo,
        trackers: Vec<Arc<dyn Announcer>>,
    ) -> Result<(
        Self,
        Arc<Shared>,
        UnboundedSender<Vec<SocketAddr>>,
        UnboundedReceiver<Alert>,
    )> {
        let storage = StorageInfo::new(metainfo, conf.download_dir.clone());
        log::info!(
            "Torrent {} has {} pieces of {} bytes ({} bytes total)",
            hex::encode(metainfo.info_hash),
            storage.piece_count,
            storage.piece_len,
            storage.total_len,
        );

        let files = TorrentFiles::open(storage.clone())?;

        let mut pieces = Vec::with_capacity(storage.piece_count);
        for index in 0..storage.piece_count {
            pieces.push(Piece::new(
                index,
                storage.piece_len(index)?,
                metainfo.piece_hash(index)?,
            ));
        }

        let (write_queue, write_port) = mpsc::unbounded_channel();
        let (peer_chan, peer_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);

        let state = TransferState {
            own_pieces: Bitfield::repeat(false, storage.piece_count),
            pieces,
            peers: HashMap::new(),
            connected_addrs: HashSet::new(),
            banned_addrs: HashMap::new(),
            rng: StdRng::from_entropy(),
            finished: false,
            io_paused: false,
            downloaded: ThruputCounter::default(),
        };

        let shared = Arc::new(Shared {
            info_hash: metainfo.info_hash,
            client_id,
            storage,
            conf,
            state: CondMutex::new(state),
            write_queue,
            stop,
            finished,
            alert_chan,
        });

        Ok((
            Self {
                shared: Arc::clone(&shared),
                files: Arc::new(files),
                trackers,
                peer_chan: Some(peer_chan.clone()),
                peer_port,
                write_port: Some(write_port),
            },
            shared,
            peer_chan,
            alert_port,
        ))
    }

    /// Runs the transfer until it is stopped or the address intake closes.
    ///
    /// Completion does not stop the transfer by itself: the engine keeps
    /// answering haves and could start seeding once that is implemented.
    pub async fn run(mut self) -> Result<()> {
        log::info!("Starting torrent {}", hex::encode(self.shared.info_hash));

        if let Some(path) = self.shared.conf.resume_file.clone() {
            self.load_resume(path).await;
        }

        let write_port =
            self.write_port.take().expect("torrent started twice");
        let writer_pool = task::spawn(writer_pool(
            Arc::clone(&self.shared),
            Arc::clone(&self.files),
            write_port,
        ));

        let peer_chan =
            self.peer_chan.take().expect("torrent started twice");
        for tracker in self.trackers.iter() {
            task::spawn(announce_loop(
                Arc::clone(&self.shared),
                Arc::clone(tracker),
                peer_chan.clone(),
            ));
        }
        // once the user handle and the announce loops are gone, the intake
        // closes and the connecter below winds the torrent down
        drop(peer_chan);

        self.connecter().await;

        // stopping: tear down whatever wasn't the reason we got here
        self.shared.stop.send_replace(true);
        self.save_resume().await;
        if writer_pool.await.is_err() {
            log::error!("Writer pool task panicked");
        }

        log::info!("Torrent {} stopped", hex::encode(self.shared.info_hash));
        Ok(())
    }

    /// The connecter: takes address batches off the intake and dials each,
    /// with a cap on concurrently connected peers.
    async fn connecter(&mut self) {
        let limit = Arc::new(Semaphore::new(
            self.shared.conf.max_connected_peer_count,
        ));
        let mut stop = self.shared.stop.subscribe();

        loop {
            tokio::select! {
                maybe_addrs = self.peer_port.recv() => {
                    match maybe_addrs {
                        Some(addrs) => {
                            for addr in addrs {
                                self.dial(addr, &limit, &mut stop).await;
                                if *stop.borrow() {
                                    return;
                                }
                            }
                        }
                        // the user dropped the handle; shut the torrent down
                        None => return,
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Vets a single address and, if it passes, spawns a peer session for
    /// it once a connection slot frees up.
    async fn dial(
        &self,
        addr: SocketAddr,
        limit: &Arc<Semaphore>,
        stop: &mut watch::Receiver<bool>,
    ) {
        if addr.port() == 0 {
            log::debug!("Skipping peer address with zero port");
            return;
        }

        {
            let mut state = self.shared.state.lock().await;
            if state.connected_addrs.contains(&addr) {
                log::trace!("Already connected to {}", addr);
                return;
            }
            if let Some(until) = state.banned_addrs.get(&addr) {
                if Instant::now() < *until {
                    log::debug!("Peer {} is in back-off, skipping", addr);
                    return;
                }
                state.banned_addrs.remove(&addr);
            }
            state.connected_addrs.insert(addr);
        }

        // waiting for a slot applies backpressure to the intake
        let permit = tokio::select! {
            permit = Arc::clone(limit).acquire_owned() => permit.ok(),
            _ = stop.changed() => None,
        };
        let permit = match permit {
            Some(permit) => permit,
            None => {
                // never dialed after all
                let mut state = self.shared.state.lock().await;
                state.connected_addrs.remove(&addr);
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        task::spawn(async move {
            let mut session = PeerSession::outbound(Arc::clone(&shared), addr);
            // confine anything that goes wrong in the session, panics
            // included, to this task
            let result = std::panic::AssertUnwindSafe(session.run())
                .catch_unwind()
                .await;

            match &result {
                Err(panic) => {
                    log::error!(
                        "Peer {} task panicked: {}",
                        addr,
                        panic_message(panic.as_ref())
                    );
                }
                Ok(Err(
                    Error::SelfConnection | Error::InfoHashMismatch,
                )) => {
                    // close silently
                    log::debug!("Peer {} rejected at handshake", addr);
                }
                Ok(Err(Error::Cancelled)) => {
                    log::debug!("Peer {} session stopped", addr);
                }
                Ok(Err(Error::ProtocolViolation(what))) => {
                    log::warn!("Peer {} protocol violation: {}", addr, what);
                    let mut state = shared.state.lock().await;
                    let until = Instant::now() + shared.conf.redial_backoff;
                    state.banned_addrs.insert(addr, until);
                }
                Ok(Err(e)) => {
                    log::info!("Peer {} session ended: {}", addr, e);
                }
                Ok(Ok(())) => {
                    log::debug!("Peer {} session ended", addr);
                }
            }

            session.cleanup().await;
            drop(permit);
        });
    }

    /// Loads the resume file, if any, and feeds every claimed piece through
    /// the writer pool so it is re-hashed against disk before being trusted.
    async fn load_resume(&self, path: PathBuf) {
        let info_hash = self.shared.info_hash;
        let piece_count = self.shared.storage.piece_count;
        let load_path = path.clone();
        let claimed = task::spawn_blocking(move || {
            disk::load_resume(&load_path, &info_hash, piece_count)
        })
        .await;

        let claimed = match claimed {
            Ok(Ok(Some(claimed))) => claimed,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                log::warn!("Failed to read resume file {:?}: {}", path, e);
                return;
            }
            Err(_) => return,
        };
        log::info!(
            "Resume file claims {} verified pieces, re-checking",
            claimed.count_ones()
        );

        for index in claimed.iter_ones() {
            let files = Arc::clone(&self.files);
            let data =
                task::spawn_blocking(move || files.read_piece(index)).await;
            match data {
                Ok(Ok(data)) => {
                    let _ = self.shared.write_queue.send(PieceWrite {
                        index,
                        data,
                        source: Source::Resume,
                    });
                }
                _ => {
                    log::warn!(
                        "Could not read back claimed piece {}, dropping it",
                        index
                    );
                }
            }
        }
    }

    /// Persists the verified piece state, if a resume file is configured.
    async fn save_resume(&self) {
        let path = match self.shared.conf.resume_file.clone() {
            Some(path) => path,
            None => return,
        };
        let own_pieces = self.shared.state.lock().await.own_pieces.clone();
        let info_hash = self.shared.info_hash;
        let result = task::spawn_blocking(move || {
            disk::save_resume(&path, &info_hash, &own_pieces)
        })
        .await;
        if let Ok(Err(e)) = result {
            log::warn!("Failed to save resume file: {}", e);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

/// The writer pool: consumes assembled pieces and fans each out to its own
/// verify-and-write task. Verification parallelism is unbounded; the actual
/// disk writes are gated by the writer semaphore.
async fn writer_pool(
    shared: Arc<Shared>,
    files: Arc<TorrentFiles>,
    mut write_port: UnboundedReceiver<PieceWrite>,
) {
    log::info!("Starting writer pool");
    let write_limit =
        Arc::new(Semaphore::new(shared.conf.writer_concurrency));
    let mut stop = shared.stop.subscribe();
    // the download rate round is closed once a second
    let mut rate_tick = time::interval(std::time::Duration::from_secs(1));
    rate_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_job = write_port.recv() => {
                match maybe_job {
                    Some(job) => {
                        task::spawn(handle_piece_write(
                            Arc::clone(&shared),
                            Arc::clone(&files),
                            Arc::clone(&write_limit),
                            job,
                        ));
                    }
                    None => break,
                }
            }
            _ = rate_tick.tick() => {
                shared.state.lock().await.downloaded.tick();
            }
            // in-flight jobs run to completion on their own tasks
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
    log::info!("Writer pool shutting down");
}

/// Verifies one assembled piece and, if valid, writes it to disk and
/// publishes the new piece to every connected peer.
async fn handle_piece_write(
    shared: Arc<Shared>,
    files: Arc<TorrentFiles>,
    write_limit: Arc<Semaphore>,
    job: PieceWrite,
) {
    let PieceWrite {
        index,
        data,
        source,
    } = job;
    let expected = shared.state.lock().await.pieces[index].hash;

    // hashing a multi-megabyte piece is too heavy for the reactor
    let (valid, data) = task::spawn_blocking(move || {
        let valid = disk::verify(&data, &expected);
        (valid, data)
    })
    .await
    .expect("piece verification task panicked");

    if !valid {
        handle_hash_mismatch(&shared, index, source).await;
        return;
    }

    // resume data came from disk; writing it back would be a no-op
    if !matches!(source, Source::Resume) {
        let _permit = write_limit
            .acquire_owned()
            .await
            .expect("writer semaphore closed");
        let write_files = Arc::clone(&files);
        let write_result = task::spawn_blocking(move || {
            let result = write_files.write_piece(index, &data);
            (result, data)
        })
        .await
        .expect("piece write task panicked");

        if let (Err(e), _) = &write_result {
            log::error!("Disk write failed for piece {}: {}", index, e);
            let mut state = shared.state.lock().await;
            state.pieces[index].queued = false;
            state.io_paused = true;
            shared.state.broadcast();
            let _ = shared.alert_chan.send(Alert::DiskFailure {
                error: e.to_string(),
            });
            return;
        }
    }

    let mut state = shared.state.lock().await;
    {
        let piece = &mut state.pieces[index];
        piece.queued = false;
        if piece.have {
            // a duplicate, e.g. a peer completed a piece that resume
            // verification already restored
            shared.state.broadcast();
            return;
        }
        piece.have = true;
    }
    state.own_pieces.set(index, true);
    log::info!(
        "Piece {} verified and stored ({}/{} pieces)",
        index,
        state.own_pieces.count_ones(),
        state.own_pieces.len()
    );

    // every connected peer learns about the new piece
    for peer in state.peers.values() {
        let _ = peer.msg_chan.send(Message::Have { piece_index: index });
    }
    let _ = shared.alert_chan.send(Alert::PieceCompleted { index });

    if state.own_pieces.all() && !state.finished {
        state.finished = true;
        shared.finished.send_replace(true);
        let _ = shared.alert_chan.send(Alert::TransferComplete);
        log::info!("Download complete");

        if let Some(path) = shared.conf.resume_file.clone() {
            let info_hash = shared.info_hash;
            let own_pieces = state.own_pieces.clone();
            task::spawn_blocking(move || {
                if let Err(e) =
                    disk::save_resume(&path, &info_hash, &own_pieces)
                {
                    log::warn!("Failed to save resume file: {}", e);
                }
            });
        }
    }

    // a verified piece can unblock downloaders: their candidate sets and
    // interest calculations all change
    shared.state.broadcast();
}

/// Handles a piece that failed verification: makes it pickable again and
/// strikes the peer that delivered it.
async fn handle_hash_mismatch(
    shared: &Shared,
    index: PieceIndex,
    source: Source,
) {
    let mut state = shared.state.lock().await;
    state.pieces[index].queued = false;

    match source {
        Source::Peer(peer_id) => {
            if let Some(peer) = state.peers.get_mut(&peer_id) {
                peer.strikes += 1;
                log::warn!(
                    "Piece {} from peer {} failed verification (strike {}/{})",
                    index,
                    peer.addr,
                    peer.strikes,
                    shared.conf.strike_threshold,
                );
                if peer.strikes >= shared.conf.strike_threshold {
                    log::warn!(
                        "Dropping peer {} after {} corrupt pieces",
                        peer.addr,
                        peer.strikes
                    );
                    let _ = peer.cmd_chan.send(peer::Command::Shutdown);
                }
            } else {
                log::warn!(
                    "Piece {} from already departed peer failed verification",
                    index
                );
            }
        }
        Source::Webseed(url) => {
            log::warn!("Piece {} from webseed {} failed verification", index, url);
        }
        Source::Resume => {
            log::info!("Resume data for piece {} is stale, re-downloading", index);
        }
    }

    // the piece is requeued: its marks were cleared when it was taken for
    // writing, so any peer may pick it up again
    shared.state.broadcast();
}

/// One tracker's announce loop: started, periodic at the clamped interval,
/// completed when the finished signal latches, stopped at shutdown.
async fn announce_loop(
    shared: Arc<Shared>,
    tracker: Arc<dyn Announcer>,
    peer_chan: UnboundedSender<Vec<SocketAddr>>,
) {
    let mut stop = shared.stop.subscribe();
    let mut finished = shared.finished.subscribe();
    let mut event = Some(Event::Started);
    let mut completed_announced = false;
    let mut consecutive_errors = 0;
    let mut interval = shared.conf.min_announce_interval;

    loop {
        let params = shared.announce_params(event).await;
        match tracker.announce(params).await {
            Ok(resp) => {
                consecutive_errors = 0;
                log::debug!(
                    "Tracker announce ok, {} peers returned",
                    resp.peers.len()
                );
                if let Some(returned) = resp.interval {
                    interval = returned.clamp(
                        shared.conf.min_announce_interval,
                        shared.conf.max_announce_interval,
                    );
                }
                if !resp.peers.is_empty() {
                    let _ = peer_chan.send(resp.peers);
                }
                if event == Some(Event::Stopped) {
                    return;
                }
                if event == Some(Event::Completed) {
                    completed_announced = true;
                }
                event = None;
            }
            Err(e) => {
                consecutive_errors += 1;
                log::warn!(
                    "Tracker announce failed ({} in a row): {}",
                    consecutive_errors,
                    e
                );
                if event == Some(Event::Stopped) {
                    return;
                }
                if consecutive_errors >= shared.conf.tracker_error_threshold {
                    log::warn!("Giving up on tracker");
                    return;
                }
            }
        }

        // completion may have latched while the announce was in flight, in
        // which case the watch below would never fire
        if !completed_announced && *finished.borrow() {
            event = Some(Event::Completed);
            continue;
        }

        tokio::select! {
            _ = time::sleep(interval) => {}
            changed = finished.changed() => {
                if changed.is_ok()
                    && *finished.borrow()
                    && !completed_announced
                {
                    event = Some(Event::Completed);
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    event = Some(Event::Stopped);
                }
            }
        }
    }
}

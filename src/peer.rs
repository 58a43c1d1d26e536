mod codec;

pub(crate) use codec::{encode_bitfield, Message};

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::EncryptionMode,
    error::*,
    piece_picker::pick_piece,
    torrent::{PieceWrite, Shared, Source},
    Bitfield, PeerId, PieceIndex, BLOCK_LEN,
};
use codec::{
    decode_bitfield, Handshake, HandshakeCodec, PeerCodec, PROTOCOL_STRING,
};

/// The commands a peer session can receive from the rest of the engine.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The window right after the handshake in which a bitfield message is
    /// accepted. It closes on the first message of any kind: a bitfield
    /// received later fails the connection, as per the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}

/// A peer's session: the dialing and handshake, the reader loop, and the two
/// helper tasks (socket writer and downloader) spawned per peer.
///
/// The session updates the shared transfer state (the peer's protocol flags,
/// its bitfield, piece availability, request marks) under the transfer mutex
/// and broadcasts on the condition variable after every change that may
/// unblock a downloader.
pub(crate) struct PeerSession {
    shared: Arc<Shared>,
    /// The remote address of the peer.
    addr: SocketAddr,
    state: State,
    /// The peer's id, known once the handshake completed and the peer is
    /// registered in the peer table.
    peer_id: Option<PeerId>,
    /// The port on which the session receives commands.
    cmd_port: UnboundedReceiver<Command>,
    cmd_chan: UnboundedSender<Command>,
    /// The per-peer write queue. Everything sent to the peer goes through
    /// this channel into the writer task, which serializes the wire order.
    msg_chan: UnboundedSender<Message>,
    msg_port: Option<UnboundedReceiver<Message>>,
    writer: Option<JoinHandle<()>>,
    downloader: Option<JoinHandle<()>>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(shared: Arc<Shared>, addr: SocketAddr) -> Self {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (msg_chan, msg_port) = mpsc::unbounded_channel();
        Self {
            shared,
            addr,
            state: State::Disconnected,
            peer_id: None,
            cmd_port,
            cmd_chan,
            msg_chan,
            msg_port: Some(msg_port),
            writer: None,
            downloader: None,
        }
    }

    /// Dials the peer, performs the handshake, and runs the session until the
    /// connection is closed, an error occurs, or the transfer stops.
    ///
    /// [`PeerSession::cleanup`] must be called once this returns, whatever
    /// the outcome.
    pub async fn run(&mut self) -> Result<()> {
        let conf = &self.shared.conf;
        if conf.encryption.outgoing == EncryptionMode::ForceEncrypted {
            // plaintext is all we speak; refusing is the only honest reading
            // of a forced-encryption config
            return Err(Error::Unsupported("forced outgoing encryption"));
        }

        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = time::timeout(
            conf.dial_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::ConnectionLost)?
        .map_err(|_| Error::ConnectionLost)?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state = State::Handshaking;
        let handshake =
            Handshake::new(self.shared.info_hash, self.shared.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket
            .send(handshake)
            .await
            .map_err(|_| Error::ConnectionLost)?;

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake =
            match time::timeout(conf.handshake_timeout, socket.next())
                .await
                .map_err(|_| Error::PeerTimeout)?
            {
                Some(Ok(handshake)) => handshake,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(Error::ProtocolViolation("handshake"));
                }
                _ => return Err(Error::ConnectionLost),
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // the codec only yields a handshake with a valid protocol string
        debug_assert_eq!(&peer_handshake.prot[..], PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.shared.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InfoHashMismatch);
        }
        // a handshake carrying our own id means we dialed ourselves
        if peer_handshake.peer_id == self.shared.client_id {
            log::debug!("Dialed ourselves at {}", self.addr);
            return Err(Error::SelfConnection);
        }
        let peer_id = peer_handshake.peer_id;

        // now that we have the handshake, we need to switch to the peer
        // message codec and keep the buffers of the original codec, as they
        // may contain bytes of any message the peer sent after its handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        // register the peer in the peer table and send our bitfield; from
        // here on `cleanup` deregisters it
        {
            let mut state = self.shared.state.lock().await;
            if state.peers.contains_key(&peer_id) {
                log::info!("Peer {} already connected", self.addr);
                return Err(Error::ConnectionLost);
            }
            state.peers.insert(
                peer_id,
                crate::torrent::PeerHandle::new(
                    self.addr,
                    self.shared.storage.piece_count,
                    peer_handshake.reserved,
                    self.msg_chan.clone(),
                    self.cmd_chan.clone(),
                ),
            );
            self.peer_id = Some(peer_id);

            let own_pieces = state.own_pieces.clone();
            // the write queue is not up yet, so this only enqueues
            self.msg_chan
                .send(Message::Bitfield(own_pieces))
                .map_err(|_| Error::ConnectionLost)?;
        }

        let (sink, stream) = socket.split();

        // the writer task owns the sink: the queue drain order is the wire
        // order, and send idleness is where keep-alives come from
        let msg_port = self.msg_port.take().expect("session started twice");
        self.writer = Some(tokio::spawn(run_writer(
            sink,
            msg_port,
            conf.keep_alive_interval,
            self.cmd_chan.clone(),
        )));

        // the downloader drives the request pipeline against this peer
        self.downloader = Some(tokio::spawn(
            Downloader {
                shared: Arc::clone(&self.shared),
                peer_id,
                msg_chan: self.msg_chan.clone(),
            }
            .run(),
        ));

        self.state = State::AvailabilityExchange;
        log::info!("Peer {} session state: {:?}", self.addr, self.state);

        self.read_loop(stream).await
    }

    /// The session's receive half: decodes peer messages and applies them to
    /// the shared state until the connection dies or the transfer stops.
    async fn read_loop(
        &mut self,
        mut stream: futures::stream::SplitStream<Framed<TcpStream, PeerCodec>>,
    ) -> Result<()> {
        let idle_timeout = self.shared.conf.idle_timeout;
        let mut stop = self.shared.stop.subscribe();
        let mut last_recv = Instant::now();
        // granular enough for a 120 s idle window
        let mut idle_check = time::interval(idle_timeout / 4);
        idle_check
            .set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    let msg = match maybe_msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e))
                            if e.kind()
                                == std::io::ErrorKind::InvalidData =>
                        {
                            return Err(Error::ProtocolViolation(
                                "invalid message",
                            ));
                        }
                        _ => return Err(Error::ConnectionLost),
                    };
                    last_recv = Instant::now();
                    self.handle_msg(msg).await?;
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            return Ok(());
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        log::debug!(
                            "Peer {} session observed stop signal",
                            self.addr
                        );
                        return Err(Error::Cancelled);
                    }
                }
                _ = idle_check.tick() => {
                    if last_recv.elapsed() >= idle_timeout {
                        log::info!("Peer {} idle, dropping", self.addr);
                        return Err(Error::PeerTimeout);
                    }
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            self.addr
        );

        // the bitfield window closes on the first message of any kind
        if self.state == State::AvailabilityExchange {
            self.state = State::Connected;
            log::info!("Peer {} session state: {:?}", self.addr, self.state);
            if let Message::Bitfield(bitfield) = msg {
                return self.handle_bitfield_msg(bitfield).await;
            }
        } else if let Message::Bitfield(_) = msg {
            log::warn!(
                "Peer {} sent bitfield not directly after handshake",
                self.addr
            );
            return Err(Error::ProtocolViolation("bitfield out of order"));
        }

        let peer_id = self.peer_id.expect("message before registration");
        let piece_count = self.shared.storage.piece_count;

        match msg {
            Message::Bitfield(_) => unreachable!("handled above"),
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                let mut state = self.shared.state.lock().await;
                if let Some(peer) = state.peers.get_mut(&peer_id) {
                    if !peer.peer_choking {
                        log::info!("Peer {} choked us", self.addr);
                        peer.peer_choking = true;
                        // the downloader resets its pending requests when it
                        // wakes and sees the flag
                        self.shared.state.broadcast();
                    }
                }
            }
            Message::Unchoke => {
                let mut state = self.shared.state.lock().await;
                if let Some(peer) = state.peers.get_mut(&peer_id) {
                    if peer.peer_choking {
                        log::info!("Peer {} unchoked us", self.addr);
                        peer.peer_choking = false;
                        self.shared.state.broadcast();
                    }
                }
            }
            Message::Interested => {
                let mut state = self.shared.state.lock().await;
                if let Some(peer) = state.peers.get_mut(&peer_id) {
                    if !peer.peer_interested {
                        log::info!("Peer {} is interested", self.addr);
                        peer.peer_interested = true;
                    }
                }
            }
            Message::NotInterested => {
                let mut state = self.shared.state.lock().await;
                if let Some(peer) = state.peers.get_mut(&peer_id) {
                    if peer.peer_interested {
                        log::info!("Peer {} is not interested", self.addr);
                        peer.peer_interested = false;
                    }
                }
            }
            Message::Have { piece_index } => {
                if piece_index >= piece_count {
                    return Err(Error::ProtocolViolation(
                        "have index out of range",
                    ));
                }
                let mut state = self.shared.state.lock().await;
                let crate::torrent::TransferState { pieces, peers, .. } =
                    &mut *state;
                if let Some(peer) = peers.get_mut(&peer_id) {
                    if !peer.pieces[piece_index] {
                        peer.pieces.set(piece_index, true);
                        pieces[piece_index].availability += 1;
                        self.shared.state.broadcast();
                    }
                }
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(peer_id, piece_index, offset, data)
                    .await?;
            }
            // the seeding half is a stub: we never unchoke anyone, so a
            // request is either an impatient peer or a protocol offender;
            // either way it is not served
            // TODO: serve requests from verified pieces once uploading lands
            Message::Request(block) => {
                let state = self.shared.state.lock().await;
                let choking = state
                    .peers
                    .get(&peer_id)
                    .map_or(true, |peer| peer.am_choking);
                debug_assert!(choking);
                log::debug!(
                    "Peer {} requested {:?} while choked, ignoring",
                    self.addr,
                    block
                );
            }
            Message::Cancel(block) => {
                log::trace!(
                    "Peer {} cancelled {:?}, nothing in flight",
                    self.addr,
                    block
                );
            }
        }

        Ok(())
    }

    /// Registers the peer's piece availability, advertised in the first
    /// message after the handshake.
    async fn handle_bitfield_msg(&mut self, bitfield: Bitfield) -> Result<()> {
        log::info!("Handling peer {} bitfield message", self.addr);
        let piece_count = self.shared.storage.piece_count;

        // The bitfield raw data that is sent over the wire is padded to
        // whole bytes; the padding must be zero and is sliced off here.
        let bitfield = decode_bitfield(bitfield, piece_count)
            .map_err(Error::ProtocolViolation)?;
        log::trace!("Peer {} has {} pieces", self.addr, bitfield.count_ones());

        let peer_id = self.peer_id.expect("bitfield before registration");
        let mut state = self.shared.state.lock().await;
        let crate::torrent::TransferState { pieces, peers, .. } = &mut *state;
        if let Some(peer) = peers.get_mut(&peer_id) {
            for index in bitfield.iter_ones() {
                pieces[index].availability += 1;
            }
            peer.pieces = bitfield;
            self.shared.state.broadcast();
        }
        Ok(())
    }

    /// Validates a received block, records it with the peer's request mark,
    /// and queues the piece for verification when it is complete.
    async fn handle_block_msg(
        &mut self,
        peer_id: PeerId,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let piece_count = self.shared.storage.piece_count;
        if piece_index >= piece_count {
            return Err(Error::ProtocolViolation("piece index out of range"));
        }
        if offset % BLOCK_LEN != 0 {
            return Err(Error::ProtocolViolation("block offset misaligned"));
        }
        let block_index = (offset / BLOCK_LEN) as usize;

        let mut state = self.shared.state.lock().await;
        let crate::torrent::TransferState {
            pieces, downloaded, ..
        } = &mut *state;
        let piece = &mut pieces[piece_index];
        if block_index >= piece.block_count()
            || data.len() != piece.block(block_index).len as usize
        {
            return Err(Error::ProtocolViolation("block layout mismatch"));
        }

        let mark = match piece.requested_from.get_mut(&peer_id) {
            Some(mark) => mark,
            None => {
                // the piece was finished by someone else or we never asked;
                // either way the data is dropped
                log::debug!(
                    "Peer {} sent block for unmarked piece {}",
                    self.addr,
                    piece_index
                );
                return Ok(());
            }
        };
        if !mark.record_received(block_index) {
            log::warn!(
                "Peer {} sent block {} of piece {} we did not request",
                self.addr,
                block_index,
                piece_index
            );
            return Ok(());
        }

        log::trace!(
            "Received block {} of piece {} from peer {}",
            block_index,
            piece_index,
            self.addr
        );
        piece.write_block(offset, &data);
        downloaded.record(data.len() as u64);

        let completed = if piece.requested_from[&peer_id].all_received() {
            piece.take_for_write()
        } else {
            None
        };
        // an in-flight slot freed up (and possibly a whole piece), so let
        // downloaders reconsider
        self.shared.state.broadcast();
        drop(state);

        if let Some(data) = completed {
            log::info!(
                "Piece {} assembled via peer {}",
                piece_index,
                self.addr
            );
            self.shared
                .write_queue
                .send(PieceWrite {
                    index: piece_index,
                    data,
                    source: Source::Peer(peer_id),
                })
                .map_err(|_| Error::Channel)?;
        }

        Ok(())
    }

    /// Deregisters the peer: removes it from the peer table, releases its
    /// request marks, decrements the availability of every piece it
    /// advertised, and wakes all downloaders so the released blocks become
    /// requestable from other peers.
    pub async fn cleanup(&mut self) {
        self.state = State::Disconnected;

        if let Some(peer_id) = self.peer_id {
            let mut state = self.shared.state.lock().await;
            if let Some(peer) = state.peers.remove(&peer_id) {
                let crate::torrent::TransferState { pieces, .. } = &mut *state;
                for index in peer.pieces.iter_ones() {
                    debug_assert!(pieces[index].availability > 0);
                    pieces[index].availability -= 1;
                }
                for piece in pieces.iter_mut() {
                    piece.unmark_selected(&peer_id);
                }
            }
            state.connected_addrs.remove(&self.addr);
            self.shared.state.broadcast();
        } else {
            let mut state = self.shared.state.lock().await;
            state.connected_addrs.remove(&self.addr);
        }

        // closing our end of the message queue lets the writer task drain
        // and exit; the downloader exits on the missing peer table entry
        let (dead_chan, _) = mpsc::unbounded_channel();
        self.msg_chan = dead_chan;

        if let Some(downloader) = self.downloader.take() {
            if let Err(e) = downloader.await {
                if e.is_panic() {
                    log::error!(
                        "Peer {} downloader panicked: {:?}",
                        self.addr,
                        e
                    );
                }
            }
        }
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                if e.is_panic() {
                    log::error!("Peer {} writer panicked: {:?}", self.addr, e);
                }
            }
        }
    }
}

/// The per-peer socket writer: drains the write queue into the sink in FIFO
/// order and emits a keep-alive whenever the queue has been idle too long.
async fn run_writer(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    mut msg_port: UnboundedReceiver<Message>,
    keep_alive_interval: std::time::Duration,
    cmd_chan: UnboundedSender<Command>,
) {
    let mut last_send = Instant::now();
    loop {
        tokio::select! {
            maybe_msg = msg_port.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                        last_send = Instant::now();
                    }
                    // all senders dropped, the session is going away
                    None => break,
                }
            }
            _ = time::sleep_until(last_send + keep_alive_interval) => {
                log::trace!("Write queue idle, sending keep alive");
                if sink.send(Message::KeepAlive).await.is_err() {
                    break;
                }
                last_send = Instant::now();
            }
        }
    }
    // wake the session so a dead socket doesn't linger until idle timeout
    let _ = cmd_chan.send(Command::Shutdown);
}

/// The per-peer download driver: repeatedly asks the picker for a piece this
/// peer can provide and runs the block request pipeline for it.
///
/// All decisions happen under the transfer mutex; every suspension is a wait
/// on the transfer's condition variable, woken by unchokes, new piece
/// availability, verified pieces, and peer disconnects. The mutex is never
/// held while a message is being sent: sends go through the write queue,
/// which preserves per-peer ordering.
struct Downloader {
    shared: Arc<Shared>,
    peer_id: PeerId,
    msg_chan: UnboundedSender<Message>,
}

impl Downloader {
    async fn run(self) {
        log::debug!("Starting downloader for peer {:?}", self.peer_id);
        loop {
            // select the next piece to download from this peer
            let piece_index = {
                let mut state = self.shared.state.lock().await;
                loop {
                    let crate::torrent::TransferState {
                        pieces,
                        own_pieces,
                        peers,
                        rng,
                        io_paused,
                        ..
                    } = &mut *state;

                    let peer = match peers.get_mut(&self.peer_id) {
                        Some(peer) => peer,
                        // deregistered: the session is gone
                        None => return,
                    };

                    if own_pieces.all() {
                        // the transfer is complete; the writer pool latched
                        // the finished signal when the last piece landed
                        if peer.am_interested {
                            peer.am_interested = false;
                            let _ =
                                self.msg_chan.send(Message::NotInterested);
                        }
                        return;
                    }

                    if !*io_paused {
                        if let Some(index) = pick_piece(
                            pieces,
                            own_pieces,
                            &peer.pieces,
                            &self.peer_id,
                            rng,
                        ) {
                            pieces[index].mark_selected(self.peer_id);
                            // the queue serializes this after any
                            // not-interested sent while we had no candidates
                            if !peer.am_interested {
                                peer.am_interested = true;
                                if self
                                    .msg_chan
                                    .send(Message::Interested)
                                    .is_err()
                                {
                                    pieces[index]
                                        .unmark_selected(&self.peer_id);
                                    return;
                                }
                            }
                            break index;
                        }
                    }

                    // nothing to pick from this peer right now; tell it so
                    // and wait for the world to change (the send happens off
                    // the mutex, on the writer task)
                    if peer.am_interested {
                        peer.am_interested = false;
                        let _ = self.msg_chan.send(Message::NotInterested);
                    }
                    state = self.shared.state.wait(state).await;
                }
            };

            log::info!(
                "Peer {:?} downloading piece {}",
                &self.peer_id[..8],
                piece_index
            );

            // the block request pipeline for the selected piece
            if !self.download_piece(piece_index).await {
                return;
            }
        }
    }

    /// Runs the request pipeline for one piece. Returns false if the session
    /// is gone and the downloader should exit.
    async fn download_piece(&self, piece_index: PieceIndex) -> bool {
        let max_in_flight = self.shared.conf.max_requests_in_flight;
        loop {
            let block;
            {
                let mut state = self.shared.state.lock().await;
                loop {
                    let crate::torrent::TransferState {
                        pieces,
                        peers,
                        io_paused,
                        ..
                    } = &mut *state;

                    let peer = match peers.get_mut(&self.peer_id) {
                        Some(peer) => peer,
                        None => return false,
                    };
                    let piece = &mut pieces[piece_index];
                    let mark =
                        match piece.requested_from.get_mut(&self.peer_id) {
                            Some(mark) => mark,
                            // the piece was completed (and our mark stolen)
                            // or failed verification; move on
                            None => return true,
                        };

                    if mark.all_received() {
                        // piece finished from this peer; the reader queued
                        // it for verification
                        return true;
                    }

                    if peer.peer_choking {
                        // outstanding requests will not be answered; put
                        // them back so they are selectable after unchoke
                        mark.reset_pending();
                        state = self.shared.state.wait(state).await;
                        continue;
                    }

                    if *io_paused
                        || mark.in_flight() >= max_in_flight
                    {
                        state = self.shared.state.wait(state).await;
                        continue;
                    }

                    match mark.next_unrequested() {
                        Some(block_index) => {
                            mark.set_requesting(block_index);
                            block = piece.block(block_index);
                            break;
                        }
                        // every block is requested or received; the reader
                        // will finish this piece as the stragglers arrive,
                        // so go pick another piece to keep the pipeline
                        // full (the mark keeps this one off our candidates)
                        None => return true,
                    }
                }
            }

            // the mutex is released; hand the request to the write queue
            log::trace!(
                "Requesting block {:?} from peer {:?}",
                block,
                &self.peer_id[..8]
            );
            if self.msg_chan.send(Message::Request(block)).is_err() {
                // the connection is gone; release the piece for others
                let mut state = self.shared.state.lock().await;
                state.pieces[piece_index].unmark_selected(&self.peer_id);
                self.shared.state.broadcast();
                return false;
            }

            let mut state = self.shared.state.lock().await;
            if let Some(mark) = state.pieces[piece_index]
                .requested_from
                .get_mut(&self.peer_id)
            {
                mark.set_requested(block.index_in_piece());
            }
        }
    }
}

//! The per-piece bookkeeping of the transfer: the expected hash, the
//! availability counter, the per-peer request marks, and the in-memory
//! assembly buffer blocks are collected into before verification.

use std::collections::HashMap;

use bitvec::prelude::{bitvec, Msb0};

use crate::{
    block_count, block_len, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// A piece of the torrent, as tracked by the transfer supervisor.
///
/// All fields are guarded by the transfer mutex.
pub(crate) struct Piece {
    /// The piece's index in the torrent.
    pub index: PieceIndex,
    /// The length of the piece, in bytes.
    pub len: u32,
    /// The expected SHA-1 hash of the piece.
    pub hash: Sha1Hash,
    /// Whether the piece has been downloaded, verified and written to disk.
    /// Implies that re-reading the piece from disk yields data matching
    /// `hash`.
    pub have: bool,
    /// Whether a completed copy of the piece is currently queued for
    /// verification and writing. Such a piece is skipped by the picker until
    /// the verdict: on success it becomes `have`, on hash failure it becomes
    /// pickable again.
    pub queued: bool,
    /// The number of currently connected peers advertising this piece.
    pub availability: usize,
    /// The per-peer request marks: which peers are working on this piece and
    /// how far along each is.
    pub requested_from: HashMap<PeerId, RequestMark>,
    /// The assembly buffer received blocks are copied into, allocated on the
    /// first block. Taken (and replaced with `None`) when the piece is
    /// queued for verification.
    pub buf: Option<Vec<u8>>,
}

impl Piece {
    pub fn new(index: PieceIndex, len: u32, hash: Sha1Hash) -> Self {
        Self {
            index,
            len,
            hash,
            have: false,
            queued: false,
            availability: 0,
            requested_from: HashMap::new(),
            buf: None,
        }
    }

    /// The number of blocks in this piece.
    pub fn block_count(&self) -> usize {
        block_count(self.len)
    }

    /// Returns the piece's blocks, in offset order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        (0..self.block_count()).map(move |i| BlockInfo {
            piece_index: self.index,
            offset: i as u32 * crate::BLOCK_LEN,
            len: block_len(self.len, i),
        })
    }

    /// The block at the given in-piece index.
    pub fn block(&self, index_in_piece: usize) -> BlockInfo {
        debug_assert!(index_in_piece < self.block_count());
        BlockInfo {
            piece_index: self.index,
            offset: index_in_piece as u32 * crate::BLOCK_LEN,
            len: block_len(self.len, index_in_piece),
        }
    }

    /// Registers that the peer started working on this piece and returns its
    /// fresh mark.
    ///
    /// A peer works one piece at a time: the picker excludes pieces the peer
    /// already has a mark on, so at most one mark per peer exists here.
    pub fn mark_selected(&mut self, peer_id: PeerId) -> &mut RequestMark {
        debug_assert!(!self.requested_from.contains_key(&peer_id));
        let len = self.len;
        self.requested_from
            .entry(peer_id)
            .or_insert_with(|| RequestMark::new(block_count(len)))
    }

    /// Releases the peer's mark, making its blocks selectable by other
    /// peers (or by this peer again, from scratch).
    pub fn unmark_selected(&mut self, peer_id: &PeerId) {
        self.requested_from.remove(peer_id);
    }

    /// Copies a received block into the piece's assembly buffer.
    pub fn write_block(&mut self, offset: u32, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= self.len as usize);
        let len = self.len;
        let buf = self
            .buf
            .get_or_insert_with(|| vec![0; len as usize]);
        buf[offset as usize..offset as usize + data.len()]
            .copy_from_slice(data);
    }

    /// Takes the fully assembled piece out for verification and writing.
    ///
    /// All marks on the piece are cleared (the piece is "stolen back" from
    /// any other peer still working on it) and the piece is flagged queued
    /// so the picker skips it until the verification verdict.
    pub fn take_for_write(&mut self) -> Option<Vec<u8>> {
        let buf = self.buf.take()?;
        debug_assert_eq!(buf.len(), self.len as usize);
        debug_assert_eq!(
            self.blocks().map(|block| block.len as usize).sum::<usize>(),
            buf.len()
        );
        self.requested_from.clear();
        self.queued = true;
        Some(buf)
    }
}

/// Tracks the progress of one peer on one piece, at block granularity.
///
/// The three bitfields only ever grow within a piece attempt and maintain
/// `received ⊆ requested ⊆ requesting`:
/// - `requesting`: blocks the downloader decided to request (set before the
///   REQUEST message is handed to the write queue);
/// - `requested`: blocks whose REQUEST was actually passed on to the wire;
/// - `received`: blocks whose PIECE message arrived.
pub(crate) struct RequestMark {
    requesting: Bitfield,
    requested: Bitfield,
    received: Bitfield,
}

impl RequestMark {
    pub fn new(block_count: usize) -> Self {
        Self {
            requesting: bitvec![u8, Msb0; 0; block_count],
            requested: bitvec![u8, Msb0; 0; block_count],
            received: bitvec![u8, Msb0; 0; block_count],
        }
    }

    /// The in-piece index of the next block that hasn't been picked for
    /// requesting yet.
    pub fn next_unrequested(&self) -> Option<usize> {
        self.requesting.iter_zeros().next()
    }

    /// The number of requests outstanding on the wire: picked but not yet
    /// answered.
    pub fn in_flight(&self) -> usize {
        self.requesting.count_ones() - self.received.count_ones()
    }

    pub fn set_requesting(&mut self, block: usize) {
        self.requesting.set(block, true);
    }

    pub fn set_requested(&mut self, block: usize) {
        debug_assert!(self.requesting[block]);
        self.requested.set(block, true);
    }

    /// Records the arrival of a block. Returns false if the block was never
    /// requested from this peer (or is a duplicate), in which case the
    /// caller should drop the data.
    ///
    /// A block may arrive after its REQUEST was handed to the write queue
    /// but before the downloader re-acquired the mutex to record the send;
    /// the answer proves the request reached the wire, so `requested` is
    /// settled here as well.
    pub fn record_received(&mut self, block: usize) -> bool {
        if !self.requesting[block] || self.received[block] {
            return false;
        }
        self.requested.set(block, true);
        self.received.set(block, true);
        true
    }

    /// Whether the peer has delivered every block of the piece.
    pub fn all_received(&self) -> bool {
        self.received.all()
    }

    /// Drops the pending request state back to what was actually received,
    /// so the undelivered blocks become selectable again. Used when the peer
    /// chokes us: outstanding requests will not be served.
    pub fn reset_pending(&mut self) {
        self.requesting = self.received.clone();
        self.requested = self.received.clone();
    }

    /// True while `received ⊆ requested ⊆ requesting` holds.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.received
            .iter_ones()
            .all(|i| self.requested[i] && self.requesting[i])
            && self.requested.iter_ones().all(|i| self.requesting[i])
    }
}

//! A simple throughput counter used for the transfer statistics surfaced by
//! the download handle.

/// Counts bytes moved on one channel (e.g. downloaded payload bytes or
/// protocol chatter) and derives a per-round rate.
///
/// A round is whatever cadence the owner calls [`ThruputCounter::tick`] on,
/// typically once a second.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThruputCounter {
    /// The total number of bytes recorded since the counter was created.
    total: u64,
    /// The bytes recorded in the current (unfinished) round.
    round: u64,
    /// The bytes recorded in the last completed round.
    last_round: u64,
}

impl ThruputCounter {
    /// Records the transfer of `bytes`.
    pub fn record(&mut self, bytes: u64) {
        self.round += bytes;
        self.total += bytes;
    }

    /// Closes the current round, making its tally available via
    /// [`ThruputCounter::rate`].
    pub fn tick(&mut self) {
        self.last_round = self.round;
        self.round = 0;
    }

    /// The bytes moved in the last completed round.
    pub fn rate(&self) -> u64 {
        self.last_round
    }

    /// The total bytes moved since creation.
    pub fn total(&self) -> u64 {
        self.total
    }
}

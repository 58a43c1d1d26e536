//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The client id prefix announced to trackers and peers, in the Azureus
/// style. The remaining 12 bytes are randomized once per process.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-FS0001-";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// The client id is generated by the engine at startup.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf { client_id: None },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers. If not
    /// set, the engine generates one from [`CLIENT_ID_PREFIX`] and a random
    /// tail, once per process.
    pub client_id: Option<PeerId>,
}

/// The outgoing connection obfuscation policy.
///
/// Only plaintext connections are currently implemented: `PreferEncrypted`
/// degrades to plaintext and `ForceEncrypted` refuses to dial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMode {
    AllowPlain,
    PreferEncrypted,
    ForceEncrypted,
}

/// The connection obfuscation configuration, per direction.
#[derive(Clone, Copy, Debug)]
pub struct EncryptionConf {
    pub outgoing: EncryptionMode,
}

impl Default for EncryptionConf {
    fn default() -> Self {
        Self {
            outgoing: EncryptionMode::AllowPlain,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The max number of concurrent peer connections a torrent may have.
    /// This also caps the connecter's concurrent outgoing dials.
    pub max_connected_peer_count: usize,

    /// The number of block requests kept outstanding per peer to saturate
    /// the link.
    pub max_requests_in_flight: usize,

    /// The number of concurrent piece writes allowed. Hash verification runs
    /// unbounded in parallel; only the disk writes themselves are gated, so
    /// memory use stays bounded while verification never queues behind IO.
    pub writer_concurrency: usize,

    /// How many failed pieces a peer may contribute before it is dropped.
    pub strike_threshold: u8,

    /// How long an outgoing TCP dial may take.
    pub dial_timeout: Duration,

    /// How long the handshake roundtrip may take after the socket is up.
    pub handshake_timeout: Duration,

    /// A peer that sends nothing for this long is dropped.
    pub idle_timeout: Duration,

    /// A keep-alive is written when the peer's write queue has been idle for
    /// this long.
    pub keep_alive_interval: Duration,

    /// Addresses that committed a protocol violation are not redialed for
    /// this long.
    pub redial_backoff: Duration,

    /// The clamp bounds applied to the announce interval returned by the
    /// tracker.
    pub min_announce_interval: Duration,
    pub max_announce_interval: Duration,

    /// After this many consecutive failures, the torrent stops announcing to
    /// a tracker.
    pub tracker_error_threshold: usize,

    /// If set, verified piece state is loaded from and saved to this file.
    /// Pieces claimed complete are re-hashed against disk before being
    /// trusted.
    pub resume_file: Option<PathBuf>,

    /// The connection obfuscation policy.
    pub encryption: EncryptionConf,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_connected_peer_count: 200,
            max_requests_in_flight: 10,
            writer_concurrency: 4,
            strike_threshold: 3,
            dial_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(120),
            redial_backoff: Duration::from_secs(60),
            min_announce_interval: Duration::from_secs(60),
            max_announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            resume_file: None,
            encryption: EncryptionConf::default(),
        }
    }
}

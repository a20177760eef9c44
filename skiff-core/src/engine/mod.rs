//! Boundary to the external torrent engine.
//!
//! The registry drives the engine through [`TorrentEngine`] commands and
//! learns about handle changes through [`EngineEventSink`] notifications that
//! the engine pushes from its own thread. Descriptor bytes are opaque here.

pub mod events;
pub mod simulated;
pub mod worker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

pub use events::{EngineEvent, EngineEventReceiver, EngineEventSink, engine_event_channel};
pub use simulated::{
    DescriptorError, SimulatedCommand, SimulatedEngine, SimulatedTorrent, build_descriptor,
    parse_descriptor,
};
pub use worker::{EventWorker, spawn_event_worker};

use crate::transfer::InfoHash;

/// Errors reported by the engine command surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Torrent engine is not running")]
    Unavailable,

    #[error("Torrent {info_hash} is not known to the engine")]
    UnknownHandle { info_hash: InfoHash },

    #[error("Invalid torrent descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("Magnet resolution timed out after {timeout:?}")]
    MagnetTimeout { timeout: Duration },

    #[error("Engine command failed: {reason}")]
    CommandFailed { reason: String },
}

/// Engine-side state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTorrentState {
    /// Waiting for an active slot.
    Queued,
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    /// All wanted pieces present, not uploading.
    Finished,
    Seeding,
    Paused,
    Error,
}

/// Tunable engine limit, the targets of the preference-change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineLimit {
    /// Bytes per second, 0 means unlimited.
    DownloadRate,
    /// Bytes per second, 0 means unlimited.
    UploadRate,
    MaxActiveDownloads,
    MaxActiveSeeds,
    MaxConnections,
    MaxPeers,
}

/// One file inside a torrent as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Path relative to the torrent's save directory.
    pub path: PathBuf,
    pub size: u64,
    pub bytes_completed: u64,
    /// Excluded from a partial download.
    pub skipped: bool,
}

impl FileEntry {
    pub fn is_complete(&self) -> bool {
        self.bytes_completed >= self.size
    }
}

/// Tracker status line for the details view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerInfo {
    pub url: String,
    pub tier: u8,
    pub working: bool,
    pub message: Option<String>,
}

/// Piece completion summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PieceSummary {
    pub total: u32,
    pub have: u32,
    pub piece_size: u32,
}

/// Tip/payment addresses embedded in a torrent by its publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaymentOptions {
    pub bitcoin: Option<String>,
    pub paypal_url: Option<String>,
}

impl PaymentOptions {
    pub fn is_empty(&self) -> bool {
        self.bitcoin.is_none() && self.paypal_url.is_none()
    }
}

/// Latest view of one engine handle, delivered with every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandleStatus {
    pub info_hash: InfoHash,
    pub name: String,
    pub state: EngineTorrentState,
    /// Size of the whole torrent in bytes.
    pub total_size: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Every wanted piece is present.
    pub complete: bool,
    /// Set when some files are skipped.
    pub partial: bool,
    pub connected_peers: u32,
    pub total_peers: u32,
    pub connected_seeds: u32,
    pub total_seeds: u32,
    pub files: Vec<FileEntry>,
    pub trackers: Vec<TrackerInfo>,
    pub pieces: PieceSummary,
    pub payment: Option<PaymentOptions>,
    pub save_path: Option<PathBuf>,
    /// The pause came from the user rather than from the engine's queueing.
    pub paused_by_user: bool,
    /// Temporary handle the engine uses to resolve magnet metadata.
    pub metadata_probe: bool,
}

impl HandleStatus {
    /// Creates a status with empty counters for a freshly added handle.
    pub fn new(info_hash: InfoHash, name: impl Into<String>, total_size: u64) -> Self {
        Self {
            info_hash,
            name: name.into(),
            state: EngineTorrentState::Queued,
            total_size,
            bytes_received: 0,
            bytes_sent: 0,
            download_rate: 0,
            upload_rate: 0,
            complete: false,
            partial: false,
            connected_peers: 0,
            total_peers: 0,
            connected_seeds: 0,
            total_seeds: 0,
            files: Vec::new(),
            trackers: Vec::new(),
            pieces: PieceSummary::default(),
            payment: None,
            save_path: None,
            paused_by_user: false,
            metadata_probe: false,
        }
    }

    /// Completion percentage, 0 to 100.
    pub fn progress(&self) -> u8 {
        if self.complete {
            return 100;
        }
        let wanted = self.wanted_size();
        if wanted == 0 {
            return 0;
        }
        let done: u64 = if self.partial {
            self.files
                .iter()
                .filter(|file| !file.skipped)
                .map(|file| file.bytes_completed)
                .sum()
        } else {
            self.bytes_received.min(wanted)
        };
        ((done.min(wanted) * 100) / wanted).min(99) as u8
    }

    /// Bytes the user asked for: the whole torrent, or the unskipped files of
    /// a partial download when their sizes are known.
    pub fn wanted_size(&self) -> u64 {
        if self.partial {
            let selected: u64 = self
                .files
                .iter()
                .filter(|file| !file.skipped)
                .map(|file| file.size)
                .sum();
            if selected > 0 {
                return selected;
            }
        }
        self.total_size
    }
}

/// One file listed in a torrent descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorFile {
    /// Path relative to the torrent's root directory.
    pub path: PathBuf,
    pub size: u64,
}

/// What the engine reads out of descriptor bytes before starting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorInfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub total_size: u64,
    pub files: Vec<DescriptorFile>,
}

impl DescriptorInfo {
    /// Bytes a selection would download; `None` selects every file.
    pub fn selected_size(&self, selection: Option<&[bool]>) -> u64 {
        match selection {
            None => self.total_size,
            Some(selection) => self
                .files
                .iter()
                .zip(selection.iter())
                .filter(|(_, selected)| **selected)
                .map(|(file, _)| file.size)
                .sum(),
        }
    }
}

/// Command surface of the external torrent engine.
///
/// Implementations must return promptly; long work belongs on the engine's
/// own threads and is reported back through [`EngineEventSink`].
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Adds a torrent from raw descriptor bytes and starts it.
    ///
    /// `selection` marks which files to download; `None` selects all.
    ///
    /// # Errors
    /// - `EngineError::InvalidDescriptor` - Bytes are not a torrent descriptor
    /// - `EngineError::Unavailable` - Engine not running
    async fn start_from_descriptor(
        &self,
        descriptor: Bytes,
        selection: Option<Vec<bool>>,
    ) -> Result<InfoHash, EngineError>;

    /// Reads identity, size and file list from a descriptor without starting it.
    ///
    /// # Errors
    /// - `EngineError::InvalidDescriptor` - Bytes are not a torrent descriptor
    fn inspect_descriptor(&self, descriptor: &[u8]) -> Result<DescriptorInfo, EngineError>;

    /// # Errors
    /// - `EngineError::UnknownHandle` - Hash not known to the engine
    /// - `EngineError::Unavailable` - Engine not running
    async fn pause(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    /// # Errors
    /// - `EngineError::UnknownHandle` - Hash not known to the engine
    /// - `EngineError::Unavailable` - Engine not running
    async fn resume(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    /// Removes a handle and optionally its downloaded data.
    ///
    /// # Errors
    /// - `EngineError::UnknownHandle` - Hash not known to the engine
    /// - `EngineError::Unavailable` - Engine not running
    async fn remove(&self, info_hash: InfoHash, delete_data: bool) -> Result<(), EngineError>;

    /// # Errors
    /// - `EngineError::Unavailable` - Engine not running
    async fn set_limit(&self, limit: EngineLimit, value: u64) -> Result<(), EngineError>;

    /// Forces an announce to every tracker of the handle.
    ///
    /// # Errors
    /// - `EngineError::UnknownHandle` - Hash not known to the engine
    async fn force_reannounce(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    /// Resolves a magnet URI to descriptor bytes through DHT and peer exchange.
    ///
    /// # Errors
    /// - `EngineError::MagnetTimeout` - Metadata not found within `timeout`
    /// - `EngineError::Unavailable` - Engine not running
    async fn fetch_magnet(&self, magnet_uri: &str, timeout: Duration)
    -> Result<Bytes, EngineError>;

    /// Session-wide download rate in bytes per second.
    fn download_rate(&self) -> u64;

    /// Session-wide upload rate in bytes per second.
    fn upload_rate(&self) -> u64;
}

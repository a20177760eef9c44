//! Transfers tracked by the registry and the identity types they share.

pub mod bittorrent;
pub mod fetching;
pub mod http;
pub mod rejected;
pub mod source;
pub mod state;
pub mod status;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

pub use bittorrent::BittorrentTransfer;
pub use fetching::{FetchListener, FetchPhase, FetchingTransfer, ResolveContext};
pub use http::{HttpOutcome, HttpTransfer};
pub use rejected::RejectedTransfer;
pub use source::{SourceScheme, SourceUri};
pub use state::{FailureReason, RejectionReason, TransferState};
pub use status::{TransferItem, TransferStatus, format_bytes_per_second};

use crate::engine::EngineError;

/// BitTorrent info-hash: SHA-1 for v1 torrents, SHA-256 for v2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
}

impl InfoHash {
    /// Creates a v1 InfoHash from a 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        InfoHash::V1(hash)
    }

    /// Creates a v2 InfoHash from a 32-byte SHA-256 hash.
    pub fn new_v2(hash: [u8; 32]) -> Self {
        InfoHash::V2(hash)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            InfoHash::V1(hash) => hash,
            InfoHash::V2(hash) => hash,
        }
    }

    /// Parses a 40 or 64 character hex string, ignoring case.
    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value.trim()).ok()?;
        Self::from_slice(&bytes)
    }

    /// Builds an InfoHash from 20 or 32 raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            20 => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(bytes);
                Some(InfoHash::V1(hash))
            }
            32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(bytes);
                Some(InfoHash::V2(hash))
            }
            _ => None,
        }
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity of a transfer inside the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TransferKey {
    /// A torrent known by its info-hash.
    Torrent(InfoHash),
    /// A fetching or HTTP transfer known by its normalized source URI.
    Source(SourceUri),
    /// Random token for entries with neither hash nor URI.
    Token(Uuid),
}

impl TransferKey {
    pub fn generate_token() -> Self {
        TransferKey::Token(Uuid::new_v4())
    }

    pub fn info_hash(&self) -> Option<InfoHash> {
        match self {
            TransferKey::Torrent(info_hash) => Some(*info_hash),
            _ => None,
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKey::Torrent(info_hash) => write!(f, "{info_hash}"),
            TransferKey::Source(uri) => write!(f, "{uri}"),
            TransferKey::Token(token) => write!(f, "token:{token}"),
        }
    }
}

/// Registry-wide insertion counter distinguishing successive entries for
/// the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Concrete transfer flavour, for display and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Bittorrent,
    Fetching,
    Http,
    Rejected,
}

/// Errors and informational outcomes of transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Download rejected: {}", .0.user_message())]
    PolicyRejected(RejectionReason),

    #[error("Transfer {key} is already in progress")]
    DuplicateIgnored { key: TransferKey },

    #[error("Timed out resolving {uri}")]
    ResolutionTimeout { uri: String },

    #[error("Failed to resolve {uri}: {reason}")]
    ResolutionFailed { uri: String, reason: String },

    #[error("Not enough space: {required} bytes required, {available} available")]
    DiskFull { required: u64, available: u64 },

    #[error("Torrent engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// State payload a transfer carries after this error.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            TransferError::PolicyRejected(reason) => Some(FailureReason::PolicyRejected(*reason)),
            TransferError::DuplicateIgnored { .. } => None,
            TransferError::ResolutionTimeout { .. } => Some(FailureReason::ResolutionTimeout),
            TransferError::ResolutionFailed { .. } => Some(FailureReason::ResolutionFailed),
            TransferError::DiskFull { .. } => Some(FailureReason::DiskFull),
            TransferError::EngineUnavailable { .. } => Some(FailureReason::EngineUnavailable),
            TransferError::Io(_) => Some(FailureReason::Io),
        }
    }

    /// Returns true if a new `download()` for the same request may succeed.
    pub fn is_transient(&self) -> bool {
        self.failure_reason()
            .is_some_and(|reason| reason.is_transient())
    }

    /// Returns a short message suitable for display.
    pub fn user_message(&self) -> &'static str {
        match self.failure_reason() {
            Some(reason) => reason.user_message(),
            None => "Already downloading",
        }
    }
}

impl From<EngineError> for TransferError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::MagnetTimeout { timeout } => TransferError::ResolutionTimeout {
                uri: format!("magnet (after {timeout:?})"),
            },
            EngineError::InvalidDescriptor { reason } => TransferError::ResolutionFailed {
                uri: "descriptor".to_string(),
                reason,
            },
            other => TransferError::EngineUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Capability every tracked transfer exposes.
///
/// Read accessors never block on I/O. `pause`/`resume` forward to whatever
/// drives the transfer and are no-ops where meaningless.
#[async_trait]
pub trait Transfer: Send + Sync {
    fn key(&self) -> &TransferKey;

    fn generation(&self) -> Generation;

    fn kind(&self) -> TransferKind;

    fn created(&self) -> DateTime<Utc>;

    /// Current immutable status record.
    fn status(&self) -> Arc<TransferStatus>;

    fn state(&self) -> TransferState {
        self.status().state
    }

    fn display_name(&self) -> String {
        self.status().display_name.clone()
    }

    fn progress(&self) -> u8 {
        self.status().progress
    }

    fn bytes_received(&self) -> u64 {
        self.status().bytes_received
    }

    fn bytes_sent(&self) -> u64 {
        self.status().bytes_sent
    }

    fn is_complete(&self) -> bool {
        self.status().complete
    }

    /// Returns true if `pause` can stop this transfer while it downloads.
    fn is_pausable(&self) -> bool {
        false
    }

    /// # Errors
    /// - `TransferError::EngineUnavailable` - Engine rejected the command
    async fn pause(&self) -> Result<(), TransferError> {
        Ok(())
    }

    /// # Errors
    /// - `TransferError::EngineUnavailable` - Engine rejected the command
    /// - `TransferError::DiskFull` - Destination still lacks space
    async fn resume(&self) -> Result<(), TransferError> {
        Ok(())
    }

    /// Freezes the transfer in `Removed` and signals cooperative tasks to stop.
    ///
    /// Returns false if it was already removed.
    fn mark_removed(&self) -> bool;

    /// Releases what the transfer holds outside the registry, such as its
    /// engine handle or partial files, and its data when `delete_data` is set.
    ///
    /// # Errors
    /// - `TransferError::EngineUnavailable` - Engine could not drop the handle
    /// - `TransferError::Io` - Files could not be deleted
    async fn release(&self, delete_data: bool) -> Result<(), TransferError>;
}

/// Shared reference to a live transfer wrapper.
///
/// Cloning is cheap and every clone observes the same updates.
#[derive(Clone)]
pub enum TransferEntry {
    Bittorrent(Arc<BittorrentTransfer>),
    Fetching(Arc<FetchingTransfer>),
    Http(Arc<HttpTransfer>),
}

impl TransferEntry {
    pub fn as_transfer(&self) -> &(dyn Transfer + 'static) {
        match self {
            TransferEntry::Bittorrent(transfer) => transfer.as_ref(),
            TransferEntry::Fetching(transfer) => transfer.as_ref(),
            TransferEntry::Http(transfer) => transfer.as_ref(),
        }
    }

    /// Returns true if both entries wrap the same instance.
    pub fn same_instance(&self, other: &TransferEntry) -> bool {
        match (self, other) {
            (TransferEntry::Bittorrent(a), TransferEntry::Bittorrent(b)) => Arc::ptr_eq(a, b),
            (TransferEntry::Fetching(a), TransferEntry::Fetching(b)) => Arc::ptr_eq(a, b),
            (TransferEntry::Http(a), TransferEntry::Http(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_bittorrent(&self) -> Option<&Arc<BittorrentTransfer>> {
        match self {
            TransferEntry::Bittorrent(transfer) => Some(transfer),
            _ => None,
        }
    }

    /// Immutable copy for rendering.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot::capture(self.as_transfer())
    }
}

impl Deref for TransferEntry {
    type Target = dyn Transfer;

    fn deref(&self) -> &Self::Target {
        self.as_transfer()
    }
}

impl fmt::Debug for TransferEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEntry")
            .field("kind", &self.kind())
            .field("key", self.key())
            .field("generation", &self.generation())
            .field("state", &self.state())
            .finish()
    }
}

/// Read-only copy of a transfer, safe to hold across refresh cycles.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub key: TransferKey,
    pub generation: Generation,
    pub kind: TransferKind,
    pub created: DateTime<Utc>,
    pub status: TransferStatus,
    /// Human-readable download rate, computed at read time.
    pub download_rate_display: String,
    /// Human-readable upload rate, computed at read time.
    pub upload_rate_display: String,
    /// Seconds until completion at the current rate.
    pub eta_seconds: Option<u64>,
}

impl TransferSnapshot {
    pub fn capture(transfer: &dyn Transfer) -> Self {
        let status = transfer.status();
        Self {
            key: transfer.key().clone(),
            generation: transfer.generation(),
            kind: transfer.kind(),
            created: transfer.created(),
            download_rate_display: format_bytes_per_second(status.download_rate),
            upload_rate_display: format_bytes_per_second(status.upload_rate),
            eta_seconds: status.eta_seconds(),
            status: status.as_ref().clone(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.status.state
    }
}

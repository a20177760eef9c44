//! What callers ask the registry to download and what they get back.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::transfer::{FetchListener, RejectedTransfer, TransferEntry};

/// A download request.
#[derive(Clone)]
pub enum DownloadRequest {
    /// Torrent reachable through an http, https, magnet or file URI.
    Torrent {
        uri: String,
        display_name: Option<String>,
        /// Only download files whose path matches this suffix.
        relative_path: Option<String>,
        /// Sent as the HTTP referrer when fetching the descriptor.
        referrer: Option<String>,
        /// Takes the resolved descriptor instead of starting it.
        listener: Option<Arc<dyn FetchListener>>,
    },
    /// Torrent whose descriptor bytes are already at hand.
    Descriptor {
        bytes: Bytes,
        /// Files to download, `None` for all.
        selection: Option<Vec<bool>>,
        display_name: Option<String>,
    },
    /// Single file over HTTP.
    Http {
        url: String,
        file_name: Option<String>,
        declared_size: Option<u64>,
    },
}

impl DownloadRequest {
    /// Torrent request with no options set.
    pub fn torrent(uri: impl Into<String>) -> Self {
        DownloadRequest::Torrent {
            uri: uri.into(),
            display_name: None,
            relative_path: None,
            referrer: None,
            listener: None,
        }
    }

    pub fn descriptor(bytes: impl Into<Bytes>) -> Self {
        DownloadRequest::Descriptor {
            bytes: bytes.into(),
            selection: None,
            display_name: None,
        }
    }

    pub fn http(url: impl Into<String>, declared_size: Option<u64>) -> Self {
        DownloadRequest::Http {
            url: url.into(),
            file_name: None,
            declared_size,
        }
    }

    /// Name to show for a rejection placeholder.
    pub(crate) fn display_name(&self) -> String {
        match self {
            DownloadRequest::Torrent {
                uri, display_name, ..
            } => display_name.clone().unwrap_or_else(|| uri.clone()),
            DownloadRequest::Descriptor { display_name, .. } => display_name
                .clone()
                .unwrap_or_else(|| "torrent".to_string()),
            DownloadRequest::Http { url, file_name, .. } => {
                file_name.clone().unwrap_or_else(|| url.clone())
            }
        }
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadRequest::Torrent {
                uri,
                relative_path,
                listener,
                ..
            } => f
                .debug_struct("Torrent")
                .field("uri", uri)
                .field("relative_path", relative_path)
                .field("listener", &listener.is_some())
                .finish(),
            DownloadRequest::Descriptor {
                bytes, selection, ..
            } => f
                .debug_struct("Descriptor")
                .field("len", &bytes.len())
                .field("selection", selection)
                .finish(),
            DownloadRequest::Http {
                url, declared_size, ..
            } => f
                .debug_struct("Http")
                .field("url", url)
                .field("declared_size", declared_size)
                .finish(),
        }
    }
}

/// Result of [`TransferRegistry::download`](crate::registry::TransferRegistry::download).
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// A new live entry.
    Admitted(TransferEntry),
    /// The key was already live; nothing new was started.
    Existing(TransferEntry),
    /// A policy gate refused; nothing was inserted.
    Rejected(RejectedTransfer),
}

impl DownloadOutcome {
    /// The live entry, for admitted and existing outcomes.
    pub fn entry(&self) -> Option<&TransferEntry> {
        match self {
            DownloadOutcome::Admitted(entry) | DownloadOutcome::Existing(entry) => Some(entry),
            DownloadOutcome::Rejected(_) => None,
        }
    }

    pub fn into_entry(self) -> Option<TransferEntry> {
        match self {
            DownloadOutcome::Admitted(entry) | DownloadOutcome::Existing(entry) => Some(entry),
            DownloadOutcome::Rejected(_) => None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, DownloadOutcome::Admitted(_))
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, DownloadOutcome::Existing(_))
    }

    pub fn rejected(&self) -> Option<&RejectedTransfer> {
        match self {
            DownloadOutcome::Rejected(rejected) => Some(rejected),
            _ => None,
        }
    }
}

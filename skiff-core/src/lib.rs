//! Skiff Core - Transfer registry and engine state reconciliation
//!
//! This crate tracks every active download (BitTorrent and HTTP), keeps each
//! transfer's lifecycle consistent while an external torrent engine reports
//! changes from its own thread, and hands consumers consistent snapshots.

pub mod config;
pub mod engine;
pub mod notify;
pub mod policy;
pub mod registry;
pub mod request;
pub mod tracing_setup;
pub mod transfer;

// Re-export main types for convenient access
pub use config::SkiffConfig;
pub use engine::{EngineError, EngineEventSink, TorrentEngine};
pub use notify::{NotificationSink, RecordingNotifier};
pub use policy::{PolicySource, StaticPolicy, SystemPolicy};
pub use registry::TransferRegistry;
pub use request::{DownloadOutcome, DownloadRequest};
pub use transfer::{
    InfoHash, Transfer, TransferEntry, TransferError, TransferKey, TransferSnapshot,
    TransferState,
};

/// Errors from setting up or running a Skiff registry.
#[derive(Debug, thiserror::Error)]
pub enum SkiffError {
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No Tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SkiffError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SkiffError::Transfer(e) => e.user_message().to_string(),
            SkiffError::Engine(e) => match e {
                EngineError::InvalidDescriptor { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                EngineError::Unavailable => "Torrent engine is not running".to_string(),
                _ => "Torrent engine error occurred".to_string(),
            },
            SkiffError::Http(_) => "Network error occurred".to_string(),
            SkiffError::Runtime(_) => "Internal error occurred".to_string(),
            SkiffError::Configuration { .. } => "Configuration error occurred".to_string(),
            SkiffError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SkiffError::Configuration { .. }
                | SkiffError::Engine(EngineError::InvalidDescriptor { .. })
                | SkiffError::Transfer(TransferError::PolicyRejected(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::RejectionReason;

    #[test]
    fn test_user_errors() {
        let invalid = SkiffError::Engine(EngineError::InvalidDescriptor {
            reason: "missing info".to_string(),
        });
        assert!(invalid.is_user_error());
        assert_eq!(invalid.user_message(), "Invalid torrent file: missing info");

        let rejected = SkiffError::Transfer(TransferError::PolicyRejected(
            RejectionReason::UnsupportedScheme,
        ));
        assert!(rejected.is_user_error());

        let engine_down = SkiffError::Engine(EngineError::Unavailable);
        assert!(!engine_down.is_user_error());
    }
}

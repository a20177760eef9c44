//! Transfer lifecycle states and the legal moves between them.

use std::fmt;

use serde::Serialize;

/// Why a policy gate refused to admit a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// BitTorrent download requested while metered-data savings are on.
    MeteredNetworkTorrent,
    /// Large or unsized HTTP download requested while metered-data savings are on.
    MeteredNetworkHttp,
    /// URI scheme is not one of `http`, `https`, `magnet` or `file`.
    UnsupportedScheme,
    /// URI could not be parsed at all.
    MalformedUri,
    /// Descriptor bytes are not a torrent.
    InvalidDescriptor,
}

impl RejectionReason {
    /// Short message suitable for showing next to the rejected request.
    pub fn user_message(self) -> &'static str {
        match self {
            RejectionReason::MeteredNetworkTorrent => {
                "Torrent download aborted: disabled on mobile data"
            }
            RejectionReason::MeteredNetworkHttp => "Cloud download aborted: disabled on mobile data",
            RejectionReason::UnsupportedScheme => "Download not supported for this link type",
            RejectionReason::MalformedUri => "Invalid download link",
            RejectionReason::InvalidDescriptor => "Invalid torrent file",
        }
    }
}

/// Cause carried by [`TransferState::Errored`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    PolicyRejected(RejectionReason),
    ResolutionTimeout,
    ResolutionFailed,
    DiskFull,
    EngineUnavailable,
    /// The engine itself reported the handle in an error state.
    EngineReported,
    Io,
}

impl FailureReason {
    /// Short message for the transfer list.
    pub fn user_message(self) -> &'static str {
        match self {
            FailureReason::PolicyRejected(reason) => reason.user_message(),
            FailureReason::ResolutionTimeout => "Timed out fetching torrent",
            FailureReason::ResolutionFailed => "Could not fetch torrent",
            FailureReason::DiskFull => "Not enough free space",
            FailureReason::EngineUnavailable => "Torrent engine not available",
            FailureReason::EngineReported => "Download error",
            FailureReason::Io => "File system error",
        }
    }

    /// Returns true if issuing the same request again may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureReason::ResolutionTimeout
                | FailureReason::ResolutionFailed
                | FailureReason::EngineUnavailable
                | FailureReason::Io
        )
    }
}

/// Lifecycle state of any transfer tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Queued,
    /// Fetching a torrent descriptor before the engine can take over.
    Resolving,
    Downloading,
    Paused,
    Seeding,
    Finished,
    Errored(FailureReason),
    /// Terminal. The entry has been evicted from the registry.
    Removed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Removed)
    }

    pub fn is_errored(self) -> bool {
        matches!(self, TransferState::Errored(_))
    }

    /// Returns the failure cause when errored.
    pub fn failure(self) -> Option<FailureReason> {
        match self {
            TransferState::Errored(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns true if moving from `self` to `next` is a single legal step.
    ///
    /// `Finished` is only entered from `Downloading`; `Errored` and `Removed`
    /// are entered from any non-terminal state; nothing leaves `Removed`.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        match (self, next) {
            (Removed, _) => false,
            (_, Removed) | (_, Errored(_)) => true,
            (_, Finished) => self == Downloading,
            (Queued, Resolving | Downloading | Paused | Seeding) => true,
            (Resolving, Queued | Downloading | Paused) => true,
            (Downloading, Queued | Paused) => true,
            (Paused, Queued | Downloading | Seeding) => true,
            (Finished, Queued | Downloading | Paused | Seeding) => true,
            (Seeding, Queued | Downloading | Paused) => true,
            (Errored(_), Queued | Resolving | Downloading | Paused | Seeding) => true,
            _ => false,
        }
    }

    /// Sequence of legal steps that takes `self` to `target`.
    ///
    /// Engines report only their latest state, so a report may skip an
    /// intermediate state the registry must still pass through. Returns an
    /// empty path when already at `target` and `None` when no legal path exists.
    pub fn path_to(self, target: TransferState) -> Option<Vec<TransferState>> {
        use TransferState::*;

        if self == target {
            return Some(Vec::new());
        }
        if self.can_transition_to(target) {
            return Some(vec![target]);
        }

        match (self, target) {
            (Queued | Resolving | Paused | Errored(_), Finished) => {
                Some(vec![Downloading, Finished])
            }
            (Downloading, Seeding) => Some(vec![Finished, Seeding]),
            (Seeding, Finished) => Some(vec![Downloading, Finished]),
            _ => None,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Queued => write!(f, "queued"),
            TransferState::Resolving => write!(f, "resolving"),
            TransferState::Downloading => write!(f, "downloading"),
            TransferState::Paused => write!(f, "paused"),
            TransferState::Seeding => write!(f, "seeding"),
            TransferState::Finished => write!(f, "finished"),
            TransferState::Errored(reason) => write!(f, "error ({})", reason.user_message()),
            TransferState::Removed => write!(f, "removed"),
        }
    }
}

//! Placeholder returned for downloads a policy gate refused.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    FailureReason, Generation, RejectionReason, Transfer, TransferError, TransferKey,
    TransferKind, TransferState, TransferStatus,
};

/// Terminal `Errored` transfer carrying the rejection reason.
///
/// Never inserted into the registry; it exists so callers can render the
/// refusal like any other transfer.
#[derive(Debug, Clone)]
pub struct RejectedTransfer {
    key: TransferKey,
    reason: RejectionReason,
    created: DateTime<Utc>,
    status: Arc<TransferStatus>,
}

impl RejectedTransfer {
    pub fn new(reason: RejectionReason, display_name: impl Into<String>) -> Self {
        let state = TransferState::Errored(FailureReason::PolicyRejected(reason));
        Self {
            key: TransferKey::generate_token(),
            reason,
            created: Utc::now(),
            status: Arc::new(TransferStatus::new(display_name, state, 0)),
        }
    }

    pub fn reason(&self) -> RejectionReason {
        self.reason
    }

    pub fn user_message(&self) -> &'static str {
        self.reason.user_message()
    }

    /// The rejection as an error value.
    pub fn error(&self) -> TransferError {
        TransferError::PolicyRejected(self.reason)
    }
}

#[async_trait]
impl Transfer for RejectedTransfer {
    fn key(&self) -> &TransferKey {
        &self.key
    }

    fn generation(&self) -> Generation {
        Generation(0)
    }

    fn kind(&self) -> TransferKind {
        TransferKind::Rejected
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn status(&self) -> Arc<TransferStatus> {
        Arc::clone(&self.status)
    }

    fn mark_removed(&self) -> bool {
        false
    }

    async fn release(&self, _delete_data: bool) -> Result<(), TransferError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_transfer_is_errored_with_reason() {
        let rejected = RejectedTransfer::new(RejectionReason::MeteredNetworkTorrent, "ubuntu");

        assert_eq!(
            rejected.state(),
            TransferState::Errored(FailureReason::PolicyRejected(
                RejectionReason::MeteredNetworkTorrent
            ))
        );
        assert_eq!(
            rejected.user_message(),
            "Torrent download aborted: disabled on mobile data"
        );
        assert!(matches!(rejected.key(), TransferKey::Token(_)));
        assert!(!rejected.is_pausable());
    }
}

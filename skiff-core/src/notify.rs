//! Terminal-transition notifications.
//!
//! The registry never calls a [`NotificationSink`] directly: notifications
//! are queued on an unbounded channel and delivered from a dispatcher task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::transfer::TransferSnapshot;

/// Receiver of finished/errored notifications.
pub trait NotificationSink: Send + Sync {
    fn on_finished(&self, transfer: &TransferSnapshot);

    fn on_errored(&self, transfer: &TransferSnapshot);
}

/// One queued notification.
#[derive(Debug, Clone)]
pub enum Notification {
    Finished(TransferSnapshot),
    Errored(TransferSnapshot),
}

impl Notification {
    pub fn snapshot(&self) -> &TransferSnapshot {
        match self {
            Notification::Finished(snapshot) | Notification::Errored(snapshot) => snapshot,
        }
    }
}

/// Fire-and-forget front of a [`NotificationSink`].
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::UnboundedSender<Notification>,
}

impl NotificationDispatcher {
    /// Starts the dispatcher task on `runtime`.
    pub fn spawn(sink: Arc<dyn NotificationSink>, runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Notification>();

        runtime.spawn(async move {
            tracing::debug!("Notification dispatcher started");
            while let Some(notification) = receiver.recv().await {
                match &notification {
                    Notification::Finished(snapshot) => sink.on_finished(snapshot),
                    Notification::Errored(snapshot) => sink.on_errored(snapshot),
                }
            }
            tracing::debug!("Notification dispatcher stopped");
        });

        Self { sender }
    }

    pub fn finished(&self, snapshot: TransferSnapshot) {
        self.send(Notification::Finished(snapshot));
    }

    pub fn errored(&self, snapshot: TransferSnapshot) {
        self.send(Notification::Errored(snapshot));
    }

    fn send(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            tracing::debug!("Notification dispatcher gone, dropping notification");
        }
    }
}

/// Logs notifications instead of surfacing them.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn on_finished(&self, transfer: &TransferSnapshot) {
        tracing::info!("Download finished: {}", transfer.status.display_name);
    }

    fn on_errored(&self, transfer: &TransferSnapshot) {
        tracing::warn!(
            "Download failed: {} ({})",
            transfer.status.display_name,
            transfer.state()
        );
    }
}

/// Collects notifications for later inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }

    pub fn finished_count(&self) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|n| matches!(n, Notification::Finished(_)))
            .count()
    }

    pub fn errored_count(&self) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|n| matches!(n, Notification::Errored(_)))
            .count()
    }

    /// Waits until at least `count` notifications arrived.
    ///
    /// Returns false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.received.lock().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl NotificationSink for RecordingNotifier {
    fn on_finished(&self, transfer: &TransferSnapshot) {
        self.received
            .lock()
            .push(Notification::Finished(transfer.clone()));
    }

    fn on_errored(&self, transfer: &TransferSnapshot) {
        self.received
            .lock()
            .push(Notification::Errored(transfer.clone()));
    }
}

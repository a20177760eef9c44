//! Plain HTTP file download.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::{
    FailureReason, Generation, SourceUri, Transfer, TransferError, TransferKey, TransferKind,
    TransferState, TransferStatus,
};

/// How a download task ended.
#[derive(Debug)]
pub enum HttpOutcome {
    Finished,
    Failed(TransferError),
    /// Removed while running; the partial file is gone.
    Canceled,
}

/// A single file fetched over HTTP into the download directory.
pub struct HttpTransfer {
    key: TransferKey,
    source: SourceUri,
    generation: Generation,
    created: DateTime<Utc>,
    destination: PathBuf,
    status: RwLock<Arc<TransferStatus>>,
    canceled: AtomicBool,
}

impl HttpTransfer {
    pub fn new(
        generation: Generation,
        source: SourceUri,
        destination: PathBuf,
        declared_size: Option<u64>,
    ) -> Self {
        let display_name = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.to_string());
        let mut status = TransferStatus::new(
            display_name,
            TransferState::Downloading,
            declared_size.unwrap_or(0),
        );
        status.save_path = Some(destination.clone());

        Self {
            key: TransferKey::Source(source.clone()),
            source,
            generation,
            created: Utc::now(),
            destination,
            status: RwLock::new(Arc::new(status)),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &SourceUri {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Fails the transfer without running it.
    ///
    /// Returns false if removed or already failed.
    pub fn mark_failed(&self, reason: FailureReason) -> bool {
        let mut failed = false;
        self.publish(|status| {
            if !status.state.is_errored() {
                status.state = TransferState::Errored(reason);
                failed = true;
            }
        });
        failed
    }

    /// Downloads the file, publishing progress as chunks arrive.
    pub async fn run(&self, client: &reqwest::Client) -> HttpOutcome {
        match self.download(client).await {
            Ok(true) => {
                if self.publish(|status| {
                    status.state = TransferState::Finished;
                    status.complete = true;
                    status.progress = 100;
                    status.download_rate = 0;
                    status.total_size = status.total_size.max(status.bytes_received);
                }) {
                    tracing::info!("HTTP download finished: {}", self.destination.display());
                    HttpOutcome::Finished
                } else {
                    HttpOutcome::Canceled
                }
            }
            Ok(false) => {
                self.discard_partial().await;
                HttpOutcome::Canceled
            }
            Err(e) => {
                tracing::warn!("HTTP download of {} failed: {}", self.source, e);
                self.discard_partial().await;
                let reason = e.failure_reason();
                let published = self.publish(|status| {
                    if let Some(reason) = reason {
                        status.state = TransferState::Errored(reason);
                    }
                    status.download_rate = 0;
                });
                if published {
                    HttpOutcome::Failed(e)
                } else {
                    HttpOutcome::Canceled
                }
            }
        }
    }

    /// Returns false if canceled before the last chunk.
    async fn download(&self, client: &reqwest::Client) -> Result<bool, TransferError> {
        let mut response = client
            .get(self.source.as_str())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(io::Error::other)?;

        if let Some(length) = response.content_length() {
            self.publish(|status| status.total_size = length);
        }
        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(&self.destination).await?;
        let started = Instant::now();
        let mut received = 0u64;

        while let Some(chunk) = response.chunk().await.map_err(io::Error::other)? {
            if self.is_canceled() {
                return Ok(false);
            }
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                (received as f64 / elapsed) as u64
            } else {
                0
            };
            self.publish(|status| {
                status.bytes_received = received;
                status.download_rate = rate;
                if status.total_size > 0 {
                    status.progress = ((received.min(status.total_size) * 100)
                        / status.total_size) as u8;
                }
            });
        }

        file.flush().await?;
        Ok(!self.is_canceled())
    }

    /// Swaps in a modified record; false once removed.
    fn publish(&self, change: impl FnOnce(&mut TransferStatus)) -> bool {
        let mut slot = self.status.write();
        if slot.state == TransferState::Removed {
            return false;
        }
        let mut status = slot.as_ref().clone();
        change(&mut status);
        *slot = Arc::new(status);
        true
    }

    async fn discard_partial(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.destination).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    "Failed to delete partial file {}: {}",
                    self.destination.display(),
                    e
                );
            }
        }
    }
}

impl fmt::Debug for HttpTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransfer")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("generation", &self.generation)
            .finish()
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    fn key(&self) -> &TransferKey {
        &self.key
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn kind(&self) -> TransferKind {
        TransferKind::Http
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn status(&self) -> Arc<TransferStatus> {
        Arc::clone(&self.status.read())
    }

    fn mark_removed(&self) -> bool {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut slot = self.status.write();
        *slot = Arc::new(slot.with_state(TransferState::Removed));
        true
    }

    async fn release(&self, delete_data: bool) -> Result<(), TransferError> {
        if !delete_data || !self.is_complete() {
            return Ok(());
        }
        match tokio::fs::remove_file(&self.destination).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

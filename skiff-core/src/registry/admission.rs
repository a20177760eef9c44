//! Admission of new downloads: policy gates, duplicate detection and the
//! hand-over from descriptor fetches to the engine.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use super::TransferRegistry;
use crate::engine::DescriptorInfo;
use crate::policy::available_space;
use crate::request::{DownloadOutcome, DownloadRequest};
use crate::transfer::source::MagnetLink;
use crate::transfer::{
    BittorrentTransfer, FailureReason, FetchListener, FetchPhase, FetchingTransfer, HttpOutcome,
    HttpTransfer, RejectedTransfer, RejectionReason, ResolveContext, SourceUri, Transfer,
    TransferEntry, TransferError, TransferKey, TransferState,
};

/// Where a torrent start left the registry.
enum Placement {
    Inserted(TransferEntry),
    Existing(TransferEntry),
    /// The fetch that produced the descriptor was canceled meanwhile.
    Abandoned,
}

impl TransferRegistry {
    /// Admits a download request.
    ///
    /// Policy refusals return [`DownloadOutcome::Rejected`] without touching
    /// the registry. A request whose key is already live returns that entry.
    pub async fn download(&self, request: DownloadRequest) -> DownloadOutcome {
        if let Some(reason) = self.gate(&request) {
            return Self::rejected(reason, request.display_name());
        }

        let outcome = match request {
            DownloadRequest::Torrent {
                uri,
                display_name,
                relative_path,
                referrer,
                listener,
            } => {
                self.download_torrent_uri(&uri, display_name, relative_path, referrer, listener)
            }
            DownloadRequest::Descriptor {
                bytes,
                selection,
                display_name,
            } => self.download_descriptor(bytes, selection, display_name).await,
            DownloadRequest::Http {
                url,
                file_name,
                declared_size,
            } => self.download_http(&url, file_name, declared_size).await,
        };

        match &outcome {
            DownloadOutcome::Admitted(entry) => {
                self.started_transfers.fetch_add(1, Ordering::SeqCst);
                tracing::info!(
                    "Admitted {} {} ({})",
                    entry.key(),
                    entry.generation(),
                    entry.state()
                );
            }
            DownloadOutcome::Existing(entry) => {
                tracing::debug!("{} already live as {}", entry.key(), entry.generation());
            }
            DownloadOutcome::Rejected(_) => {}
        }
        outcome
    }

    /// Metered-network gate, evaluated before anything else.
    fn gate(&self, request: &DownloadRequest) -> Option<RejectionReason> {
        if !self.policy.is_metered_and_saving_data() {
            return None;
        }
        match request {
            DownloadRequest::Torrent { .. } | DownloadRequest::Descriptor { .. } => {
                Some(RejectionReason::MeteredNetworkTorrent)
            }
            DownloadRequest::Http { declared_size, .. } => {
                let limit = self.config.registry.metered_http_limit_bytes;
                match declared_size {
                    Some(size) if *size <= limit => None,
                    _ => Some(RejectionReason::MeteredNetworkHttp),
                }
            }
        }
    }

    fn rejected(reason: RejectionReason, display_name: String) -> DownloadOutcome {
        tracing::info!("Rejected download of {}: {}", display_name, reason.user_message());
        DownloadOutcome::Rejected(RejectedTransfer::new(reason, display_name))
    }

    /// Entry a source URI already produced, if it is still live.
    fn live_source(&self, source: &SourceUri) -> Option<TransferEntry> {
        let mapped = self.sources.lock().get(source).cloned()?;
        if mapped.state() == TransferState::Removed {
            return None;
        }
        Some(mapped)
    }

    /// Errored fetches and HTTP downloads give way to a retry.
    fn retire_failed(&self, entry: &TransferEntry) -> bool {
        if matches!(entry, TransferEntry::Bittorrent(_)) || !entry.state().is_errored() {
            return false;
        }
        tracing::debug!("Replacing failed {} with a new attempt", entry.key());
        self.remove(entry, false);
        true
    }

    fn download_torrent_uri(
        &self,
        uri: &str,
        display_name: Option<String>,
        relative_path: Option<String>,
        referrer: Option<String>,
        listener: Option<Arc<dyn FetchListener>>,
    ) -> DownloadOutcome {
        let source = match SourceUri::parse(uri) {
            Ok(source) => source,
            Err(reason) => {
                return Self::rejected(reason, display_name.unwrap_or_else(|| uri.to_string()));
            }
        };

        if let Some(existing) = self.live_source(&source) {
            if !self.retire_failed(&existing) {
                return DownloadOutcome::Existing(existing);
            }
        }
        if let Some(info_hash) = source.info_hash() {
            if let Some(existing) = self.get(&TransferKey::Torrent(info_hash)) {
                self.sources.lock().insert(source, existing.clone());
                return DownloadOutcome::Existing(existing);
            }
        }

        let display_name = display_name.or_else(|| {
            MagnetLink::parse(uri).and_then(|magnet| magnet.display_name)
        });
        let fetching = Arc::new(FetchingTransfer::new(
            self.next_generation(),
            source.clone(),
            display_name,
            relative_path,
            referrer,
            listener,
        ));
        let entry = TransferEntry::Fetching(Arc::clone(&fetching));
        {
            let mut collections = self.collections.lock();
            if let Some(existing) = collections.live(entry.key()) {
                return DownloadOutcome::Existing(existing);
            }
            collections.insert(entry.clone());
            collections.check_invariants();
        }
        self.sources.lock().insert(source, entry.clone());

        let context = ResolveContext {
            engine: Arc::clone(&self.engine),
            http: self.http.clone(),
            http_timeout: self.config.registry.http_timeout,
            magnet_timeout: self.config.registry.magnet_timeout,
            max_descriptor_bytes: self.config.registry.max_descriptor_bytes,
        };
        self.runtime
            .spawn(run_fetch(self.this.clone(), fetching, context));

        DownloadOutcome::Admitted(entry)
    }

    async fn download_descriptor(
        &self,
        bytes: Bytes,
        selection: Option<Vec<bool>>,
        display_name: Option<String>,
    ) -> DownloadOutcome {
        let info = match self.engine.inspect_descriptor(&bytes) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Unreadable torrent descriptor: {}", e);
                return Self::rejected(
                    RejectionReason::InvalidDescriptor,
                    display_name.unwrap_or_else(|| "torrent".to_string()),
                );
            }
        };

        match self.start_torrent(bytes, &info, selection, None).await {
            Placement::Inserted(entry) => DownloadOutcome::Admitted(entry),
            Placement::Existing(entry) => DownloadOutcome::Existing(entry),
            // Only fetches can be abandoned.
            Placement::Abandoned => Self::rejected(
                RejectionReason::InvalidDescriptor,
                display_name.unwrap_or(info.name),
            ),
        }
    }

    /// Inserts a torrent for `info` and asks the engine to start it.
    ///
    /// With `superseding`, the new torrent takes the fetch's position in the
    /// ordered list in the same critical section that retires the fetch.
    async fn start_torrent(
        &self,
        bytes: Bytes,
        info: &DescriptorInfo,
        selection: Option<Vec<bool>>,
        superseding: Option<&Arc<FetchingTransfer>>,
    ) -> Placement {
        let info_hash = info.info_hash;
        let key = TransferKey::Torrent(info_hash);

        if let Some(existing) = self.get(&key) {
            return self.adopt_existing(existing, superseding);
        }

        self.await_teardown(info_hash).await;

        let required = info.selected_size(selection.as_deref());
        let available = available_space(&self.policy).await;
        let disk_full = available < required;
        if disk_full {
            tracing::warn!(
                "Not enough space for {}: {} bytes required, {} available",
                info.name,
                required,
                available
            );
        }

        let transfer = Arc::new(BittorrentTransfer::from_descriptor(
            self.next_generation(),
            info,
            selection.as_deref(),
            Arc::clone(&self.engine),
            Arc::clone(&self.policy),
            disk_full,
        ));
        let entry = TransferEntry::Bittorrent(Arc::clone(&transfer));

        {
            let mut collections = self.collections.lock();
            if let Some(existing) = collections.live(&key) {
                drop(collections);
                return self.adopt_existing(existing, superseding);
            }
            match superseding {
                Some(fetching) => {
                    let current = TransferEntry::Fetching(Arc::clone(fetching));
                    if !collections.replace(&current, entry.clone()) {
                        return Placement::Abandoned;
                    }
                    fetching.finish(FetchPhase::HandedOff);
                }
                None => collections.insert(entry.clone()),
            }
            collections.check_invariants();
        }
        if let Some(fetching) = superseding {
            self.sources
                .lock()
                .insert(fetching.source().clone(), entry.clone());
            tracing::info!("{} resolved to {}", fetching.source(), info_hash);
        }

        match self.engine.start_from_descriptor(bytes, selection).await {
            Ok(_) => {
                if transfer.state() == TransferState::Removed {
                    // Removed before the engine knew it; undo the start.
                    if let Err(e) = self.engine.remove(info_hash, false).await {
                        tracing::debug!("Rollback of {} failed: {}", info_hash, e);
                    }
                } else if disk_full {
                    if let Err(e) = self.engine.pause(info_hash).await {
                        tracing::warn!("Failed to hold {} for disk space: {}", info_hash, e);
                    }
                    self.notifications.errored(entry.snapshot());
                }
            }
            Err(e) => {
                tracing::warn!("Engine failed to start {}: {}", info_hash, e);
                let reason = TransferError::from(e)
                    .failure_reason()
                    .unwrap_or(FailureReason::EngineUnavailable);
                if transfer.mark_failed(reason) {
                    self.notifications.errored(entry.snapshot());
                }
            }
        }

        Placement::Inserted(entry)
    }

    /// The torrent is already live; retire a fetch that resolved to it.
    fn adopt_existing(
        &self,
        existing: TransferEntry,
        superseding: Option<&Arc<FetchingTransfer>>,
    ) -> Placement {
        if let Some(fetching) = superseding {
            let current = TransferEntry::Fetching(Arc::clone(fetching));
            {
                let mut collections = self.collections.lock();
                if !collections.evict(&current) {
                    return Placement::Abandoned;
                }
                fetching.finish(FetchPhase::HandedOff);
                collections.check_invariants();
            }
            let mut sources = self.sources.lock();
            sources.retain(|_, mapped| !mapped.same_instance(&current));
            sources.insert(fetching.source().clone(), existing.clone());
            tracing::info!(
                "{} resolved to already live {}",
                fetching.source(),
                existing.key()
            );
        }
        Placement::Existing(existing)
    }

    /// Finishes a fetch once its resolution task returned.
    async fn complete_fetch(
        &self,
        fetching: Arc<FetchingTransfer>,
        result: Result<Bytes, TransferError>,
    ) {
        if fetching.is_canceled() {
            tracing::debug!("Fetch of {} was canceled", fetching.source());
            return;
        }

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail_fetch(&fetching, &e);
                return;
            }
        };

        if let Some(listener) = fetching.listener() {
            let current = TransferEntry::Fetching(Arc::clone(&fetching));
            {
                let mut collections = self.collections.lock();
                if !collections.evict(&current) {
                    return;
                }
                fetching.finish(FetchPhase::HandedOff);
                collections.check_invariants();
            }
            self.forget_source(&current);
            tracing::info!(
                "Handing descriptor from {} to listener (token {})",
                fetching.source(),
                fetching.token()
            );
            listener.on_descriptor_fetched(bytes, fetching.source(), fetching.token());
            return;
        }

        let info = match self.engine.inspect_descriptor(&bytes) {
            Ok(info) => info,
            Err(e) => {
                self.fail_fetch(&fetching, &TransferError::from(e));
                return;
            }
        };
        let selection = fetching.selection(&info);

        if let Placement::Abandoned = self
            .start_torrent(bytes, &info, selection, Some(&fetching))
            .await
        {
            tracing::debug!("Fetch of {} ended before hand-off", fetching.source());
        }
    }

    fn fail_fetch(&self, fetching: &Arc<FetchingTransfer>, error: &TransferError) {
        let reason = error
            .failure_reason()
            .unwrap_or(FailureReason::ResolutionFailed);
        if fetching.finish(FetchPhase::Errored(reason)) {
            tracing::warn!("Failed to fetch {}: {}", fetching.source(), error);
            self.notifications
                .errored(TransferEntry::Fetching(Arc::clone(fetching)).snapshot());
        }
    }

    async fn download_http(
        &self,
        url: &str,
        file_name: Option<String>,
        declared_size: Option<u64>,
    ) -> DownloadOutcome {
        let display_name = file_name.clone().unwrap_or_else(|| url.to_string());
        let source = match SourceUri::parse(url) {
            Ok(source) if source.scheme().is_http() => source,
            Ok(_) => return Self::rejected(RejectionReason::UnsupportedScheme, display_name),
            Err(reason) => return Self::rejected(reason, display_name),
        };

        let key = TransferKey::Source(source.clone());
        if let Some(existing) = self.get(&key) {
            if !self.retire_failed(&existing) {
                return DownloadOutcome::Existing(existing);
            }
        }

        let name = file_name
            .as_deref()
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .or_else(|| source.file_name())
            .unwrap_or_else(|| "download".to_string());
        let destination = self.config.policy.destination.join(name);

        let transfer = Arc::new(HttpTransfer::new(
            self.next_generation(),
            source,
            destination,
            declared_size,
        ));
        let entry = TransferEntry::Http(Arc::clone(&transfer));
        {
            let mut collections = self.collections.lock();
            if let Some(existing) = collections.live(&key) {
                return DownloadOutcome::Existing(existing);
            }
            collections.insert(entry.clone());
            collections.check_invariants();
        }

        let required = declared_size.unwrap_or(0);
        let available = available_space(&self.policy).await;
        if available < required {
            tracing::warn!(
                "Not enough space for {}: {} bytes required, {} available",
                transfer.destination().display(),
                required,
                available
            );
            if transfer.mark_failed(FailureReason::DiskFull) {
                self.notifications.errored(entry.snapshot());
            }
            return DownloadOutcome::Admitted(entry);
        }
        if transfer.is_canceled() {
            // Removed while free space was looked up.
            return DownloadOutcome::Admitted(entry);
        }

        self.runtime
            .spawn(run_http(self.this.clone(), transfer, self.http.clone()));
        DownloadOutcome::Admitted(entry)
    }

    fn complete_http(&self, transfer: &Arc<HttpTransfer>, outcome: HttpOutcome) {
        let entry = TransferEntry::Http(Arc::clone(transfer));
        match outcome {
            HttpOutcome::Finished => {
                self.downloads_to_review.fetch_add(1, Ordering::SeqCst);
                self.notifications.finished(entry.snapshot());
            }
            HttpOutcome::Failed(_) => self.notifications.errored(entry.snapshot()),
            HttpOutcome::Canceled => {
                tracing::debug!("HTTP download {} canceled", transfer.source());
            }
        }
    }
}

/// Resolution task of one fetching transfer.
async fn run_fetch(
    registry: Weak<TransferRegistry>,
    fetching: Arc<FetchingTransfer>,
    context: ResolveContext,
) {
    if fetching.is_canceled() {
        return;
    }
    tracing::debug!("Fetching descriptor from {}", fetching.source());
    let result = fetching.resolve(&context).await;

    let Some(registry) = registry.upgrade() else {
        return;
    };
    registry.complete_fetch(fetching, result).await;
}

async fn run_http(
    registry: Weak<TransferRegistry>,
    transfer: Arc<HttpTransfer>,
    client: reqwest::Client,
) {
    let outcome = transfer.run(&client).await;
    if let Some(registry) = registry.upgrade() {
        registry.complete_http(&transfer, outcome);
    }
}

//! Authoritative collection of live transfers.
//!
//! One mutex guards the ordered list, the key map and the tombstones of
//! removed torrents; every mutation of the three happens in a single critical
//! section. A second, narrower mutex maps normalized source URIs to the entry
//! they produced. The two locks are never held together. Engine calls, disk
//! access and notifications always happen outside both.

mod admission;
mod reconcile;

pub use reconcile::spawn_policy_monitor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::SkiffError;
use crate::config::{EngineSettings, SkiffConfig};
use crate::engine::{
    EngineEventReceiver, EngineLimit, EventWorker, TorrentEngine, spawn_event_worker,
};
use crate::notify::{NotificationDispatcher, NotificationSink};
use crate::policy::PolicySource;
use crate::transfer::{
    BittorrentTransfer, Generation, InfoHash, SourceUri, Transfer, TransferEntry, TransferKey,
    TransferSnapshot, TransferState,
};

/// Resolves to whether the engine released the handle.
type Teardown = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct Collections {
    order: Vec<TransferEntry>,
    by_key: HashMap<TransferKey, TransferEntry>,
    /// Torrents removed by the caller whose engine removal is unconfirmed.
    tombstones: HashMap<InfoHash, Generation>,
}

impl Collections {
    fn live(&self, key: &TransferKey) -> Option<TransferEntry> {
        self.by_key.get(key).cloned()
    }

    fn is_live(&self, entry: &TransferEntry) -> bool {
        self.by_key
            .get(entry.key())
            .is_some_and(|live| live.same_instance(entry))
    }

    fn insert(&mut self, entry: TransferEntry) {
        self.by_key.insert(entry.key().clone(), entry.clone());
        self.order.push(entry);
    }

    /// Drops `entry` from both structures; false if it was not live.
    fn evict(&mut self, entry: &TransferEntry) -> bool {
        if !self.is_live(entry) {
            return false;
        }
        self.by_key.remove(entry.key());
        self.order.retain(|candidate| !candidate.same_instance(entry));
        true
    }

    /// Puts `replacement` at the position of `current` under its own key.
    fn replace(&mut self, current: &TransferEntry, replacement: TransferEntry) -> bool {
        if !self.is_live(current) {
            return false;
        }
        let Some(index) = self
            .order
            .iter()
            .position(|candidate| candidate.same_instance(current))
        else {
            return false;
        };

        self.by_key.remove(current.key());
        self.by_key
            .insert(replacement.key().clone(), replacement.clone());
        self.order[index] = replacement;
        true
    }

    fn check_invariants(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        let in_sync = self.order.len() == self.by_key.len()
            && self.order.iter().all(|entry| self.is_live(entry));
        let keyed = self.by_key.iter().all(|(key, entry)| {
            entry.key() == key && (key.info_hash().is_none() || entry.as_bittorrent().is_some())
        });
        if !in_sync || !keyed {
            tracing::error!(
                "Registry collections diverged: {} ordered, {} keyed",
                self.order.len(),
                self.by_key.len()
            );
        }
        debug_assert!(in_sync, "ordered list and key map diverged");
        debug_assert!(keyed, "entry stored under a foreign key");
    }
}

/// Thread-safe registry of every live transfer.
///
/// Created behind an `Arc` and shared with the event worker, background
/// tasks and callers. No method returns an error to the caller: policy
/// refusals come back as data and engine failures are logged.
pub struct TransferRegistry {
    this: Weak<TransferRegistry>,
    collections: Mutex<Collections>,
    sources: Mutex<HashMap<SourceUri, TransferEntry>>,
    teardowns: Mutex<HashMap<InfoHash, (Generation, Teardown)>>,
    engine: Arc<dyn TorrentEngine>,
    policy: Arc<dyn PolicySource>,
    notifications: NotificationDispatcher,
    config: SkiffConfig,
    http: reqwest::Client,
    runtime: Handle,
    generations: AtomicU64,
    downloads_to_review: AtomicU64,
    started_transfers: AtomicU64,
    worker: Mutex<Option<EventWorker>>,
}

impl TransferRegistry {
    /// Creates a registry without an event worker.
    ///
    /// Engine events must then be fed through [`apply_engine_events`](Self::apply_engine_events).
    ///
    /// # Errors
    /// - `SkiffError::Runtime` - Called outside a Tokio runtime
    /// - `SkiffError::Http` - HTTP client could not be built
    pub fn new(
        config: SkiffConfig,
        engine: Arc<dyn TorrentEngine>,
        policy: Arc<dyn PolicySource>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Arc<Self>, SkiffError> {
        let runtime = Handle::try_current()?;
        let http = reqwest::Client::builder()
            .user_agent(config.registry.user_agent)
            .connect_timeout(config.registry.http_timeout)
            .build()?;
        let notifications = NotificationDispatcher::spawn(notifier, &runtime);

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            collections: Mutex::new(Collections::default()),
            sources: Mutex::new(HashMap::new()),
            teardowns: Mutex::new(HashMap::new()),
            engine,
            policy,
            notifications,
            config,
            http,
            runtime,
            generations: AtomicU64::new(0),
            downloads_to_review: AtomicU64::new(0),
            started_transfers: AtomicU64::new(0),
            worker: Mutex::new(None),
        }))
    }

    /// Creates a registry and starts the worker draining `events`.
    ///
    /// # Errors
    /// - `SkiffError::Runtime` - Called outside a Tokio runtime
    /// - `SkiffError::Http` - HTTP client could not be built
    pub fn start(
        config: SkiffConfig,
        engine: Arc<dyn TorrentEngine>,
        policy: Arc<dyn PolicySource>,
        notifier: Arc<dyn NotificationSink>,
        events: EngineEventReceiver,
    ) -> Result<Arc<Self>, SkiffError> {
        let registry = Self::new(config, engine, policy, notifier)?;
        let worker = spawn_event_worker(Arc::downgrade(&registry), events);
        *registry.worker.lock() = Some(worker);
        tracing::info!("Transfer registry started");
        Ok(registry)
    }

    /// Stops the event worker. Live entries are left untouched.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        tracing::info!("Transfer registry stopped");
    }

    pub fn config(&self) -> &SkiffConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn TorrentEngine> {
        &self.engine
    }

    pub fn policy(&self) -> &Arc<dyn PolicySource> {
        &self.policy
    }

    fn next_generation(&self) -> Generation {
        Generation(self.generations.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Live entry for `key`.
    pub fn get(&self, key: &TransferKey) -> Option<TransferEntry> {
        self.collections.lock().live(key)
    }

    /// Live torrent with this info-hash.
    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<BittorrentTransfer>> {
        self.get(&TransferKey::Torrent(info_hash))
            .and_then(|entry| entry.as_bittorrent().cloned())
    }

    /// Live entries in insertion order.
    pub fn transfers(&self) -> Vec<TransferEntry> {
        self.collections.lock().order.clone()
    }

    fn torrents(&self) -> Vec<Arc<BittorrentTransfer>> {
        self.collections
            .lock()
            .order
            .iter()
            .filter_map(|entry| entry.as_bittorrent().cloned())
            .collect()
    }

    /// Read-only copies of every live entry, in insertion order.
    pub fn snapshot(&self) -> Vec<TransferSnapshot> {
        self.transfers()
            .iter()
            .map(TransferEntry::snapshot)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.collections.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while a torrent removed by the caller awaits engine confirmation.
    pub fn is_tombstoned(&self, info_hash: InfoHash) -> bool {
        self.collections.lock().tombstones.contains_key(&info_hash)
    }

    /// Evicts a live entry and marks it `Removed`.
    ///
    /// Returns once the entry is gone from every collection. Engine removal
    /// and data deletion run afterwards on background tasks. Returns false
    /// if `entry` was not live, e.g. already removed or superseded.
    pub fn remove(&self, entry: &TransferEntry, delete_data: bool) -> bool {
        {
            let mut collections = self.collections.lock();
            if !collections.evict(entry) {
                return false;
            }
            entry.mark_removed();
            if let TransferEntry::Bittorrent(transfer) = entry {
                collections
                    .tombstones
                    .insert(transfer.info_hash(), transfer.generation());
            }
            collections.check_invariants();
        }
        self.forget_source(entry);

        tracing::info!(
            "Removed {} {} ({})",
            entry.key(),
            entry.generation(),
            entry.display_name()
        );
        self.spawn_teardown(entry.clone(), delete_data);
        true
    }

    fn forget_source(&self, entry: &TransferEntry) {
        self.sources
            .lock()
            .retain(|_, mapped| !mapped.same_instance(entry));
    }

    fn spawn_teardown(&self, entry: TransferEntry, delete_data: bool) {
        match entry {
            TransferEntry::Bittorrent(transfer) => {
                let info_hash = transfer.info_hash();
                let generation = transfer.generation();
                let task = self.runtime.spawn(async move {
                    match transfer.release(delete_data).await {
                        Ok(()) => true,
                        Err(e) => {
                            // The tombstone stays: queued reports for this
                            // generation must not bring the torrent back.
                            tracing::warn!("Engine did not remove {}: {}", info_hash, e);
                            false
                        }
                    }
                });
                let teardown = task.map(|released| released.unwrap_or(false)).boxed().shared();
                self.teardowns
                    .lock()
                    .insert(info_hash, (generation, teardown));
            }
            TransferEntry::Http(transfer) => {
                self.runtime.spawn(async move {
                    if let Err(e) = transfer.release(delete_data).await {
                        tracing::warn!(
                            "Failed to delete {}: {}",
                            transfer.destination().display(),
                            e
                        );
                    }
                });
            }
            TransferEntry::Fetching(_) => {}
        }
    }

    fn clear_tombstone(&self, info_hash: InfoHash, generation: Generation) {
        let mut collections = self.collections.lock();
        if collections.tombstones.get(&info_hash) == Some(&generation) {
            collections.tombstones.remove(&info_hash);
        }
    }

    /// Waits until the engine teardown of an earlier generation finished.
    ///
    /// Called before the same torrent is downloaded again. If the engine
    /// never released the old handle no `Removed` confirmation will arrive,
    /// so the re-download lifts the tombstone itself.
    async fn await_teardown(&self, info_hash: InfoHash) {
        let pending = self.teardowns.lock().get(&info_hash).cloned();
        let Some((generation, teardown)) = pending else {
            return;
        };
        let released = teardown.await;

        {
            let mut teardowns = self.teardowns.lock();
            if teardowns
                .get(&info_hash)
                .is_some_and(|(pending, _)| *pending == generation)
            {
                teardowns.remove(&info_hash);
            }
        }
        if !released {
            self.clear_tombstone(info_hash, generation);
        }
    }

    /// Drops every entry. Engine handles are kept, so a later report for
    /// one of them brings it back as a newly discovered torrent.
    pub fn clear(&self) {
        let cleared = {
            let mut collections = self.collections.lock();
            let cleared = std::mem::take(&mut collections.order);
            collections.by_key.clear();
            for entry in &cleared {
                entry.mark_removed();
            }
            collections.check_invariants();
            cleared
        };
        self.sources.lock().clear();
        tracing::info!("Cleared {} transfers", cleared.len());
    }

    /// Pauses every torrent that is downloading or queued.
    pub async fn pause_all(&self) {
        for transfer in self.torrents() {
            if transfer.is_pausable() && !transfer.is_seeding() {
                if let Err(e) = transfer.pause().await {
                    tracing::warn!("Failed to pause {}: {}", transfer.info_hash(), e);
                }
            }
        }
    }

    /// Returns true if resuming `transfer` is allowed right now.
    ///
    /// A finished torrent counts only while seeding is allowed; anything
    /// else counts when paused.
    pub fn is_resumable(&self, transfer: &BittorrentTransfer) -> bool {
        if transfer.is_finished() && !self.policy.is_seeding_allowed_now() {
            return false;
        }
        transfer.is_paused()
    }

    /// Resumes paused, unfinished torrents unless metered-data savings are on.
    pub async fn resume_resumable(&self) {
        if self.policy.is_metered_and_saving_data() {
            return;
        }
        for transfer in self.torrents() {
            if self.is_resumable(&transfer) && !transfer.is_finished() {
                if let Err(e) = transfer.resume().await {
                    tracing::warn!("Failed to resume {}: {}", transfer.info_hash(), e);
                }
            }
        }
    }

    /// Resumes paused, finished torrents so they seed, when seeding is allowed.
    pub async fn seed_finished(&self) {
        if self.policy.is_metered_and_saving_data() {
            return;
        }
        for transfer in self.torrents() {
            if self.is_resumable(&transfer) && transfer.is_finished() {
                if let Err(e) = transfer.resume().await {
                    tracing::warn!("Failed to seed {}: {}", transfer.info_hash(), e);
                }
            }
        }
    }

    /// Pauses every seeding or finished torrent.
    pub async fn stop_seeding(&self) {
        for transfer in self.torrents() {
            let state = transfer.state();
            let seeding = transfer.is_seeding() || transfer.is_finished();
            if seeding && state != TransferState::Paused && !state.is_errored() {
                if let Err(e) = transfer.pause().await {
                    tracing::warn!("Failed to stop seeding {}: {}", transfer.info_hash(), e);
                }
            }
        }
    }

    /// Removes completed non-torrent transfers, errored entries, and
    /// finished torrents that are paused.
    pub fn clear_complete(&self) {
        for entry in self.transfers() {
            let clearable = match &entry {
                TransferEntry::Bittorrent(transfer) => {
                    (transfer.is_finished() && transfer.is_paused())
                        || transfer.state().is_errored()
                }
                TransferEntry::Http(_) | TransferEntry::Fetching(_) => {
                    entry.is_complete() || entry.state().is_errored()
                }
            };
            if clearable {
                self.remove(&entry, false);
            }
        }
    }

    /// Cancels HTTP downloads and descriptor fetches still in flight.
    pub fn stop_http_transfers(&self) {
        for entry in self.transfers() {
            let in_flight = matches!(
                entry.state(),
                TransferState::Downloading | TransferState::Resolving
            );
            if !matches!(entry, TransferEntry::Bittorrent(_)) && in_flight {
                self.remove(&entry, false);
            }
        }
    }

    /// Transfers downloading without error and not yet complete.
    pub fn active_downloads(&self) -> usize {
        self.transfers()
            .iter()
            .filter(|entry| !matches!(entry, TransferEntry::Fetching(_)))
            .filter(|entry| entry.state() == TransferState::Downloading && !entry.is_complete())
            .count()
    }

    /// Finished torrents that are still uploading.
    pub fn active_uploads(&self) -> usize {
        self.torrents()
            .iter()
            .filter(|transfer| {
                let state = transfer.state();
                transfer.is_finished() && state != TransferState::Paused && !state.is_errored()
            })
            .count()
    }

    /// Engine download rate plus every HTTP download, in bytes per second.
    pub fn downloads_bandwidth(&self) -> u64 {
        let http: u64 = self
            .transfers()
            .iter()
            .filter(|entry| matches!(entry, TransferEntry::Http(_)))
            .map(|entry| entry.status().download_rate)
            .sum();
        self.engine.download_rate() + http
    }

    pub fn uploads_bandwidth(&self) -> u64 {
        self.engine.upload_rate()
    }

    pub fn is_http_download_in_progress(&self) -> bool {
        self.transfers().iter().any(|entry| {
            matches!(entry, TransferEntry::Http(_)) && entry.state() == TransferState::Downloading
        })
    }

    /// Finished downloads the user has not looked at yet.
    pub fn downloads_to_review(&self) -> u64 {
        self.downloads_to_review.load(Ordering::SeqCst)
    }

    pub fn clear_downloads_to_review(&self) {
        self.downloads_to_review.store(0, Ordering::SeqCst);
    }

    /// Downloads admitted since the last reset.
    pub fn started_transfers(&self) -> u64 {
        self.started_transfers.load(Ordering::SeqCst)
    }

    pub fn reset_started_transfers(&self) {
        self.started_transfers.store(0, Ordering::SeqCst);
    }

    /// Asks the engine to announce every torrent to its trackers again.
    pub async fn force_reannounce_all(&self) {
        for transfer in self.torrents() {
            if let Err(e) = self.engine.force_reannounce(transfer.info_hash()).await {
                tracing::warn!("Failed to reannounce {}: {}", transfer.info_hash(), e);
            }
        }
    }

    pub async fn set_engine_limit(&self, limit: EngineLimit, value: u64) {
        match self.engine.set_limit(limit, value).await {
            Ok(()) => tracing::debug!("Engine limit {:?} set to {}", limit, value),
            Err(e) => tracing::warn!("Failed to set engine limit {:?}: {}", limit, e),
        }
    }

    /// Pushes every engine setting, e.g. after preferences changed.
    pub async fn apply_engine_settings(&self, settings: &EngineSettings) {
        for (limit, value) in settings.limits() {
            self.set_engine_limit(limit, value).await;
        }
    }
}

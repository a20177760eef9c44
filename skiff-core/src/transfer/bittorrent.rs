//! Transfer wrapping one torrent engine handle.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{
    FailureReason, Generation, InfoHash, Transfer, TransferError, TransferItem, TransferKey,
    TransferKind, TransferState, TransferStatus,
};
use crate::engine::{
    DescriptorInfo, EngineTorrentState, FileEntry, HandleStatus, PaymentOptions, PieceSummary,
    TorrentEngine, TrackerInfo,
};
use crate::policy::{PolicySource, available_space};

/// Maps the engine's view of a handle onto the transfer lifecycle.
pub fn engine_state_to_transfer(state: EngineTorrentState) -> TransferState {
    match state {
        EngineTorrentState::Queued | EngineTorrentState::CheckingFiles => TransferState::Queued,
        EngineTorrentState::DownloadingMetadata | EngineTorrentState::Downloading => {
            TransferState::Downloading
        }
        EngineTorrentState::Finished => TransferState::Finished,
        EngineTorrentState::Seeding => TransferState::Seeding,
        EngineTorrentState::Paused => TransferState::Paused,
        EngineTorrentState::Error => TransferState::Errored(FailureReason::EngineReported),
    }
}

/// Returns true once an engine report confirms a caller's pause or resume.
fn acknowledges(desired: TransferState, reported: TransferState) -> bool {
    match desired {
        TransferState::Paused => reported == TransferState::Paused || reported.is_errored(),
        _ => reported != TransferState::Paused,
    }
}

/// State transitions one engine report caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub previous: TransferState,
    /// Legal steps taken, empty when the state did not change.
    pub steps: Vec<TransferState>,
}

impl ReportOutcome {
    pub fn entered(&self, state: TransferState) -> bool {
        self.steps.contains(&state)
    }

    pub fn entered_finished(&self) -> bool {
        self.entered(TransferState::Finished)
    }

    /// Newly errored, as opposed to still errored.
    pub fn entered_errored(&self) -> bool {
        !self.previous.is_errored() && self.steps.last().is_some_and(|state| state.is_errored())
    }

    pub fn current(&self) -> TransferState {
        self.steps.last().copied().unwrap_or(self.previous)
    }
}

#[derive(Debug, Clone)]
struct TorrentRecord {
    status: Arc<TransferStatus>,
    handle: Arc<HandleStatus>,
    /// Caller intent not yet confirmed by the engine.
    desired: Option<TransferState>,
    /// Admitted without enough free space; held in `Errored(DiskFull)`.
    disk_full: bool,
}

fn status_from_handle(
    handle: &HandleStatus,
    state: TransferState,
    previous: Option<&TransferStatus>,
) -> TransferStatus {
    let floor = |pick: fn(&TransferStatus) -> u64| previous.map(pick).unwrap_or(0);
    TransferStatus {
        display_name: handle.name.clone(),
        state,
        progress: handle.progress(),
        total_size: handle.wanted_size(),
        bytes_received: handle.bytes_received.max(floor(|s| s.bytes_received)),
        bytes_sent: handle.bytes_sent.max(floor(|s| s.bytes_sent)),
        download_rate: handle.download_rate,
        upload_rate: handle.upload_rate,
        complete: handle.complete,
        connected_peers: handle.connected_peers,
        total_peers: handle.total_peers,
        connected_seeds: handle.connected_seeds,
        total_seeds: handle.total_seeds,
        save_path: handle.save_path.clone(),
    }
}

/// A torrent known to the engine.
///
/// The wrapper instance lives as long as its registry entry; engine reports
/// replace its record in place so holders of the wrapper see every update.
pub struct BittorrentTransfer {
    key: TransferKey,
    info_hash: InfoHash,
    generation: Generation,
    created: DateTime<Utc>,
    engine: Arc<dyn TorrentEngine>,
    policy: Arc<dyn PolicySource>,
    record: RwLock<TorrentRecord>,
    items: Mutex<Option<(Arc<HandleStatus>, Arc<Vec<TransferItem>>)>>,
    removed: AtomicBool,
}

impl BittorrentTransfer {
    pub fn new(
        generation: Generation,
        handle: HandleStatus,
        engine: Arc<dyn TorrentEngine>,
        policy: Arc<dyn PolicySource>,
        disk_full: bool,
    ) -> Self {
        let state = if disk_full {
            TransferState::Errored(FailureReason::DiskFull)
        } else {
            engine_state_to_transfer(handle.state)
        };
        let status = status_from_handle(&handle, state, None);

        Self {
            key: TransferKey::Torrent(handle.info_hash),
            info_hash: handle.info_hash,
            generation,
            created: Utc::now(),
            engine,
            policy,
            record: RwLock::new(TorrentRecord {
                status: Arc::new(status),
                handle: Arc::new(handle),
                desired: None,
                disk_full,
            }),
            items: Mutex::new(None),
            removed: AtomicBool::new(false),
        }
    }

    /// Wrapper for a descriptor the caller is about to start.
    ///
    /// The engine has not reported yet, so the record is built from the
    /// descriptor and starts out `Downloading`.
    pub fn from_descriptor(
        generation: Generation,
        info: &DescriptorInfo,
        selection: Option<&[bool]>,
        engine: Arc<dyn TorrentEngine>,
        policy: Arc<dyn PolicySource>,
        disk_full: bool,
    ) -> Self {
        let mut handle = HandleStatus::new(info.info_hash, info.name.clone(), info.total_size);
        handle.state = EngineTorrentState::Downloading;
        handle.files = info
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| FileEntry {
                path: file.path.clone(),
                size: file.size,
                bytes_completed: 0,
                skipped: selection
                    .is_some_and(|selection| !selection.get(index).copied().unwrap_or(true)),
            })
            .collect();
        handle.partial = handle.files.iter().any(|file| file.skipped);

        Self::new(generation, handle, engine, policy, disk_full)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Latest engine record, including fields not mirrored in the status.
    pub fn handle(&self) -> Arc<HandleStatus> {
        Arc::clone(&self.record.read().handle)
    }

    /// Replaces the record with a newer engine report.
    ///
    /// Counters never move backwards, skipped states are walked through in
    /// order, and an unconfirmed pause or resume outranks stale reports.
    /// Returns `None` when the report was ignored.
    pub fn apply_report(&self, handle: HandleStatus) -> Option<ReportOutcome> {
        let outcome = {
            let mut record = self.record.write();
            if self.removed.load(Ordering::SeqCst) {
                return None;
            }

            let current = record.status.state;
            let reported = engine_state_to_transfer(handle.state);
            let (target, desired) = if record.disk_full {
                (current, record.desired)
            } else {
                match record.desired {
                    Some(wanted) if !acknowledges(wanted, reported) => (current, Some(wanted)),
                    _ => (reported, None),
                }
            };

            let Some(steps) = current.path_to(target) else {
                tracing::warn!(
                    "Dropping report for {}: no legal path from {} to {}",
                    self.info_hash,
                    current,
                    target
                );
                return None;
            };

            let status = status_from_handle(&handle, target, Some(record.status.as_ref()));
            *record = TorrentRecord {
                status: Arc::new(status),
                handle: Arc::new(handle),
                desired,
                disk_full: record.disk_full,
            };
            ReportOutcome {
                previous: current,
                steps,
            }
        };

        *self.items.lock() = None;
        Some(outcome)
    }

    /// Moves a live transfer to `Errored(reason)` outside of engine reports.
    ///
    /// Returns false if removed or already errored.
    pub fn mark_failed(&self, reason: FailureReason) -> bool {
        let mut record = self.record.write();
        if self.removed.load(Ordering::SeqCst) || record.status.state.is_errored() {
            return false;
        }
        record.status = Arc::new(record.status.with_state(TransferState::Errored(reason)));
        record.desired = None;
        true
    }

    /// Records a caller's pause or resume the engine has accepted.
    fn apply_intent(&self, wanted: TransferState) {
        let mut record = self.record.write();
        if self.removed.load(Ordering::SeqCst) || record.disk_full {
            return;
        }
        let current = record.status.state;
        if current.path_to(wanted).is_none() {
            return;
        }

        let confirmed = acknowledges(wanted, engine_state_to_transfer(record.handle.state));
        record.status = Arc::new(record.status.with_state(wanted));
        record.desired = if confirmed { None } else { Some(wanted) };
    }

    /// Files the user selected, computed on first use after each update.
    pub fn items(&self) -> Arc<Vec<TransferItem>> {
        let handle = self.handle();
        let mut cache = self.items.lock();
        if let Some((cached_for, items)) = cache.as_ref() {
            if Arc::ptr_eq(cached_for, &handle) {
                return Arc::clone(items);
            }
        }

        let items: Arc<Vec<TransferItem>> = Arc::new(
            handle
                .files
                .iter()
                .filter(|file| !file.skipped)
                .map(TransferItem::from)
                .collect(),
        );
        *cache = Some((handle, Arc::clone(&items)));
        items
    }

    /// Releases the cached item list until it is next requested.
    pub fn drop_cached_items(&self) {
        *self.items.lock() = None;
    }

    pub fn has_cached_items(&self) -> bool {
        self.items.lock().is_some()
    }

    pub fn trackers(&self) -> Vec<TrackerInfo> {
        self.handle().trackers.clone()
    }

    pub fn pieces(&self) -> PieceSummary {
        self.handle().pieces
    }

    /// Tip addresses the publisher embedded, if any.
    pub fn payment(&self) -> Option<PaymentOptions> {
        self.handle()
            .payment
            .clone()
            .filter(|payment| !payment.is_empty())
    }

    pub fn save_path(&self) -> Option<PathBuf> {
        self.handle().save_path.clone()
    }

    /// Connected and known peers.
    pub fn peers(&self) -> (u32, u32) {
        let status = self.status();
        (status.connected_peers, status.total_peers)
    }

    /// Connected and known seeds.
    pub fn seeds(&self) -> (u32, u32) {
        let status = self.status();
        (status.connected_seeds, status.total_seeds)
    }

    pub fn eta_seconds(&self) -> Option<u64> {
        self.status().eta_seconds()
    }

    pub fn is_partial(&self) -> bool {
        self.handle().partial
    }

    pub fn is_paused(&self) -> bool {
        self.state() == TransferState::Paused
    }

    pub fn is_seeding(&self) -> bool {
        self.state() == TransferState::Seeding
    }

    /// All wanted data is present, whatever the current state.
    pub fn is_finished(&self) -> bool {
        self.status().complete
    }

    pub fn is_disk_full(&self) -> bool {
        self.record.read().disk_full
    }

    /// Shareable magnet link naming this torrent and its trackers.
    pub fn magnet_uri(&self) -> String {
        let handle = self.handle();
        let mut uri = format!("magnet:?xt=urn:btih:{}", self.info_hash);
        if !handle.name.is_empty() {
            uri.push_str("&dn=");
            uri.push_str(&urlencoding::encode(&handle.name));
        }
        for tracker in &handle.trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(&tracker.url));
        }
        uri
    }
}

#[async_trait]
impl Transfer for BittorrentTransfer {
    fn key(&self) -> &TransferKey {
        &self.key
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn kind(&self) -> TransferKind {
        TransferKind::Bittorrent
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn status(&self) -> Arc<TransferStatus> {
        Arc::clone(&self.record.read().status)
    }

    fn is_pausable(&self) -> bool {
        matches!(
            self.state(),
            TransferState::Queued | TransferState::Downloading | TransferState::Seeding
        )
    }

    async fn pause(&self) -> Result<(), TransferError> {
        if self.removed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.pause(self.info_hash).await?;
        self.apply_intent(TransferState::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<(), TransferError> {
        if self.removed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.is_disk_full() {
            let status = self.status();
            let required = status.total_size.saturating_sub(status.bytes_received);
            let available = available_space(&self.policy).await;
            if available < required {
                return Err(TransferError::DiskFull {
                    required,
                    available,
                });
            }
        }

        self.engine.resume(self.info_hash).await?;

        let wanted = if self.status().complete {
            TransferState::Seeding
        } else {
            TransferState::Downloading
        };
        {
            let mut record = self.record.write();
            if record.disk_full && !self.removed.load(Ordering::SeqCst) {
                tracing::info!("Space available again for {}, resuming", self.info_hash);
                record.disk_full = false;
            }
        }
        self.apply_intent(wanted);
        Ok(())
    }

    fn mark_removed(&self) -> bool {
        let mut record = self.record.write();
        if self.removed.swap(true, Ordering::SeqCst) {
            return false;
        }
        record.status = Arc::new(record.status.with_state(TransferState::Removed));
        record.desired = None;
        true
    }

    async fn release(&self, delete_data: bool) -> Result<(), TransferError> {
        *self.items.lock() = None;
        self.engine.remove(self.info_hash, delete_data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FileEntry, SimulatedEngine, SimulatedTorrent, engine_event_channel};
    use crate::policy::StaticPolicy;

    fn transfer_for(handle: HandleStatus, disk_full: bool) -> (BittorrentTransfer, Arc<StaticPolicy>) {
        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let policy = Arc::new(StaticPolicy::new());
        let transfer =
            BittorrentTransfer::new(Generation(1), handle, engine, policy.clone(), disk_full);
        (transfer, policy)
    }

    fn handle(state: EngineTorrentState, received: u64) -> HandleStatus {
        let mut handle = HandleStatus::new(InfoHash::new([7u8; 20]), "ubuntu.iso", 1000);
        handle.state = state;
        handle.bytes_received = received;
        handle
    }

    #[test]
    fn test_report_expands_skipped_finish() {
        let (transfer, _) = transfer_for(handle(EngineTorrentState::Downloading, 0), false);

        let mut done = handle(EngineTorrentState::Seeding, 1000);
        done.complete = true;
        let outcome = transfer.apply_report(done).unwrap();

        assert_eq!(
            outcome.steps,
            vec![TransferState::Finished, TransferState::Seeding]
        );
        assert!(outcome.entered_finished());
        assert_eq!(transfer.state(), TransferState::Seeding);
        assert_eq!(transfer.progress(), 100);
    }

    #[test]
    fn test_counters_never_decrease() {
        let (transfer, _) = transfer_for(handle(EngineTorrentState::Downloading, 500), false);
        transfer.apply_report(handle(EngineTorrentState::Downloading, 200));
        assert_eq!(transfer.bytes_received(), 500);

        transfer.apply_report(handle(EngineTorrentState::Downloading, 700));
        assert_eq!(transfer.bytes_received(), 700);
    }

    #[test]
    fn test_removed_transfer_ignores_reports() {
        let (transfer, _) = transfer_for(handle(EngineTorrentState::Downloading, 100), false);
        assert!(transfer.mark_removed());
        assert!(!transfer.mark_removed());

        assert!(transfer.apply_report(handle(EngineTorrentState::Downloading, 900)).is_none());
        assert_eq!(transfer.state(), TransferState::Removed);
        assert_eq!(transfer.bytes_received(), 100);
    }

    #[test]
    fn test_disk_full_holds_errored_state() {
        let (transfer, _) = transfer_for(handle(EngineTorrentState::Downloading, 0), true);
        assert_eq!(
            transfer.state(),
            TransferState::Errored(FailureReason::DiskFull)
        );

        transfer.apply_report(handle(EngineTorrentState::Downloading, 10));
        assert_eq!(
            transfer.state(),
            TransferState::Errored(FailureReason::DiskFull)
        );
        assert_eq!(transfer.bytes_received(), 10);
    }

    #[tokio::test]
    async fn test_resume_rechecks_disk_space() {
        let (transfer, policy) = transfer_for(handle(EngineTorrentState::Downloading, 0), true);
        policy.set_available_bytes(10);

        let result = transfer.resume().await;
        assert!(matches!(result, Err(TransferError::DiskFull { .. })));
        assert!(transfer.is_disk_full());
    }

    #[tokio::test]
    async fn test_pause_survives_stale_report() {
        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let torrent = SimulatedTorrent::new("file.bin", &[("file.bin", 1000)]);
        let info_hash = engine
            .start_from_descriptor(torrent.descriptor.clone(), None)
            .await
            .unwrap();
        let transfer = BittorrentTransfer::new(
            Generation(1),
            engine.handle(info_hash).unwrap(),
            engine.clone(),
            Arc::new(StaticPolicy::new()),
            false,
        );

        transfer.pause().await.unwrap();
        assert_eq!(transfer.state(), TransferState::Paused);

        // Report produced before the engine processed the pause.
        let mut stale = engine.handle(info_hash).unwrap();
        stale.state = EngineTorrentState::Downloading;
        stale.bytes_received = 50;
        transfer.apply_report(stale);
        assert_eq!(transfer.state(), TransferState::Paused);
        assert_eq!(transfer.bytes_received(), 50);

        transfer.apply_report(engine.handle(info_hash).unwrap());
        assert_eq!(transfer.state(), TransferState::Paused);
    }

    #[test]
    fn test_items_are_cached_until_update() {
        let mut initial = handle(EngineTorrentState::Downloading, 0);
        initial.files = vec![
            FileEntry {
                path: PathBuf::from("a"),
                size: 500,
                bytes_completed: 0,
                skipped: false,
            },
            FileEntry {
                path: PathBuf::from("b"),
                size: 500,
                bytes_completed: 0,
                skipped: true,
            },
        ];
        let (transfer, _) = transfer_for(initial.clone(), false);

        let first = transfer.items();
        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first, &transfer.items()));

        initial.files[0].bytes_completed = 500;
        transfer.apply_report(initial);
        assert!(!transfer.has_cached_items());
        assert!(transfer.items()[0].complete);

        transfer.drop_cached_items();
        assert!(!transfer.has_cached_items());
    }

    #[test]
    fn test_magnet_uri() {
        let (transfer, _) = transfer_for(handle(EngineTorrentState::Downloading, 0), false);
        assert_eq!(
            transfer.magnet_uri(),
            format!("magnet:?xt=urn:btih:{}&dn=ubuntu.iso", "07".repeat(20))
        );
    }

    #[test]
    fn test_from_descriptor_marks_unselected_files() {
        let torrent = SimulatedTorrent::new("album", &[("a.flac", 300), ("b.flac", 700)]);
        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let transfer = BittorrentTransfer::from_descriptor(
            Generation(2),
            &torrent.info,
            Some(&[false, true]),
            engine,
            Arc::new(StaticPolicy::new()),
            false,
        );

        assert_eq!(transfer.state(), TransferState::Downloading);
        assert!(transfer.is_partial());
        assert_eq!(transfer.status().total_size, 700);
        assert_eq!(transfer.items().len(), 1);
    }

    #[test]
    fn test_mark_failed_once() {
        let (transfer, _) = transfer_for(handle(EngineTorrentState::Downloading, 0), false);
        assert!(transfer.mark_failed(FailureReason::EngineUnavailable));
        assert!(!transfer.mark_failed(FailureReason::EngineUnavailable));
        assert_eq!(
            transfer.state(),
            TransferState::Errored(FailureReason::EngineUnavailable)
        );

        assert!(transfer.mark_removed());
        assert!(!transfer.mark_failed(FailureReason::Io));
    }
}

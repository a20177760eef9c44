//! Applying engine reports and background policy to live torrents.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::TransferRegistry;
use crate::engine::{EngineEvent, HandleStatus};
use crate::transfer::{
    BittorrentTransfer, InfoHash, Transfer, TransferEntry, TransferKey, TransferState,
    bittorrent::ReportOutcome,
};

enum Target {
    Known(Arc<BittorrentTransfer>, HandleStatus),
    Discovered(Arc<BittorrentTransfer>),
}

impl TransferRegistry {
    /// Applies a batch of engine events in order.
    pub fn apply_engine_events(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.apply_engine_event(event);
        }
    }

    /// Applies one engine event.
    ///
    /// Never blocks on the engine: follow-up commands such as auto-resume
    /// run on background tasks.
    pub fn apply_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Added(status) | EngineEvent::Updated(status) => {
                self.apply_handle_status(status);
            }
            EngineEvent::Removed(info_hash) => self.apply_engine_removal(info_hash),
        }
    }

    fn apply_handle_status(&self, status: HandleStatus) {
        if status.metadata_probe {
            tracing::trace!("Ignoring metadata probe {}", status.info_hash);
            return;
        }

        let info_hash = status.info_hash;
        let key = TransferKey::Torrent(info_hash);
        let target = {
            let mut collections = self.collections.lock();
            match collections.live(&key) {
                Some(TransferEntry::Bittorrent(transfer)) => Target::Known(transfer, status),
                Some(other) => {
                    tracing::error!("Torrent key {} maps to {:?}", key, other);
                    debug_assert!(false, "torrent key mapped to a non-torrent entry");
                    return;
                }
                None => {
                    if collections.tombstones.contains_key(&info_hash) {
                        tracing::debug!("Ignoring report for removed torrent {}", info_hash);
                        return;
                    }
                    let transfer = Arc::new(BittorrentTransfer::new(
                        self.next_generation(),
                        status,
                        Arc::clone(&self.engine),
                        Arc::clone(&self.policy),
                        false,
                    ));
                    collections.insert(TransferEntry::Bittorrent(Arc::clone(&transfer)));
                    collections.check_invariants();
                    Target::Discovered(transfer)
                }
            }
        };

        match target {
            Target::Known(transfer, status) => {
                if let Some(outcome) = transfer.apply_report(status) {
                    self.after_report(&transfer, &outcome);
                }
            }
            Target::Discovered(transfer) => self.after_discovery(&transfer),
        }
    }

    fn apply_engine_removal(&self, info_hash: InfoHash) {
        let evicted = {
            let mut collections = self.collections.lock();
            if collections.tombstones.remove(&info_hash).is_some() {
                tracing::debug!("Engine confirmed removal of {}", info_hash);
                return;
            }
            let Some(entry) = collections.live(&TransferKey::Torrent(info_hash)) else {
                return;
            };
            collections.evict(&entry);
            entry.mark_removed();
            collections.check_invariants();
            entry
        };
        self.forget_source(&evicted);
        tracing::info!("Engine removed {} ({})", info_hash, evicted.display_name());
    }

    /// A torrent the registry learned about from the engine, e.g. restored
    /// from a previous session.
    fn after_discovery(&self, transfer: &Arc<BittorrentTransfer>) {
        let handle = transfer.handle();
        tracing::info!(
            "Discovered torrent {} ({}) in {}",
            transfer.info_hash(),
            handle.name,
            transfer.state()
        );

        let seeding_blocked = transfer.is_finished() && !self.policy.is_seeding_allowed_now();
        if transfer.is_paused()
            && !handle.paused_by_user
            && !seeding_blocked
            && !self.policy.is_metered_and_saving_data()
        {
            tracing::debug!("Resuming {} paused by the engine", transfer.info_hash());
            self.spawn_resume(Arc::clone(transfer));
        } else if seeding_blocked
            && matches!(
                transfer.state(),
                TransferState::Seeding | TransferState::Finished
            )
        {
            self.spawn_pause(Arc::clone(transfer), "seeding not allowed");
        }
    }

    fn after_report(&self, transfer: &Arc<BittorrentTransfer>, outcome: &ReportOutcome) {
        if outcome.steps.is_empty() {
            return;
        }
        tracing::debug!(
            "{}: {} -> {:?}",
            transfer.info_hash(),
            outcome.previous,
            outcome.steps
        );

        if outcome.entered_finished() {
            tracing::info!("Torrent finished: {}", transfer.display_name());
            self.downloads_to_review.fetch_add(1, Ordering::SeqCst);
            self.notifications
                .finished(TransferEntry::Bittorrent(Arc::clone(transfer)).snapshot());
            if !self.policy.is_seeding_allowed_now() {
                self.spawn_pause(Arc::clone(transfer), "seeding not allowed");
            }
        }
        if outcome.entered_errored() {
            tracing::warn!(
                "Torrent errored: {} ({})",
                transfer.display_name(),
                outcome.current()
            );
            self.notifications
                .errored(TransferEntry::Bittorrent(Arc::clone(transfer)).snapshot());
        }
    }

    fn spawn_pause(&self, transfer: Arc<BittorrentTransfer>, why: &'static str) {
        self.runtime.spawn(async move {
            tracing::debug!("Pausing {}: {}", transfer.info_hash(), why);
            if let Err(e) = transfer.pause().await {
                tracing::warn!("Failed to pause {}: {}", transfer.info_hash(), e);
            }
        });
    }

    fn spawn_resume(&self, transfer: Arc<BittorrentTransfer>) {
        self.runtime.spawn(async move {
            if let Err(e) = transfer.resume().await {
                tracing::warn!("Failed to resume {}: {}", transfer.info_hash(), e);
            }
        });
    }

    /// Pauses seeding and finished torrents while seeding is not allowed.
    ///
    /// Returns how many torrents were paused.
    pub async fn enforce_seeding_policy(&self) -> usize {
        if self.policy.is_seeding_allowed_now() {
            return 0;
        }

        let mut paused = 0;
        for transfer in self.torrents() {
            if !matches!(
                transfer.state(),
                TransferState::Seeding | TransferState::Finished
            ) {
                continue;
            }
            match transfer.pause().await {
                Ok(()) => paused += 1,
                Err(e) => tracing::warn!("Failed to stop seeding {}: {}", transfer.info_hash(), e),
            }
        }
        if paused > 0 {
            tracing::info!("Seeding not allowed, paused {} torrents", paused);
        }
        paused
    }
}

/// Re-evaluates the seeding policy every `interval` until the registry is dropped.
pub fn spawn_policy_monitor(registry: &Arc<TransferRegistry>, interval: Duration) -> JoinHandle<()> {
    let registry: Weak<TransferRegistry> = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!("Policy monitor started");

        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.enforce_seeding_policy().await;
        }

        tracing::debug!("Policy monitor stopped");
    })
}

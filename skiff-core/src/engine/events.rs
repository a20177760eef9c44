//! Engine-to-registry event channel.
//!
//! The engine calls [`EngineEventSink`] from its own thread. Pushing never
//! blocks: events are merged into a per-hash pending slot and a wake-up is
//! offered on a bounded channel. The consumer drains every pending slot on
//! each wake-up, so a burst of progress updates for one torrent collapses
//! into its latest status.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::HandleStatus;
use crate::transfer::InfoHash;

/// Notification about one engine handle.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Handle created, or replayed at startup.
    Added(HandleStatus),
    Updated(HandleStatus),
    /// Engine finished tearing the handle down.
    Removed(InfoHash),
}

impl EngineEvent {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            EngineEvent::Added(status) | EngineEvent::Updated(status) => status.info_hash,
            EngineEvent::Removed(info_hash) => *info_hash,
        }
    }
}

/// Merged events for one hash awaiting the consumer.
#[derive(Debug)]
enum PendingEvent {
    /// Latest status, remembering whether any merged event was an add.
    Upsert {
        status: Box<HandleStatus>,
        added: bool,
    },
    Removed,
    /// A removal followed by a re-add; delivered as both, in that order.
    Replaced(Box<HandleStatus>),
}

impl PendingEvent {
    fn from_event(event: EngineEvent) -> Self {
        match event {
            EngineEvent::Added(status) => PendingEvent::Upsert {
                status: Box::new(status),
                added: true,
            },
            EngineEvent::Updated(status) => PendingEvent::Upsert {
                status: Box::new(status),
                added: false,
            },
            EngineEvent::Removed(_) => PendingEvent::Removed,
        }
    }

    fn merge(self, event: EngineEvent) -> Self {
        match (self, event) {
            (_, EngineEvent::Removed(_)) => PendingEvent::Removed,
            (PendingEvent::Upsert { .. }, EngineEvent::Added(status)) => PendingEvent::Upsert {
                status: Box::new(status),
                added: true,
            },
            (PendingEvent::Upsert { added, .. }, EngineEvent::Updated(status)) => {
                PendingEvent::Upsert {
                    status: Box::new(status),
                    added,
                }
            }
            (
                PendingEvent::Removed | PendingEvent::Replaced(_),
                EngineEvent::Added(status) | EngineEvent::Updated(status),
            ) => PendingEvent::Replaced(Box::new(status)),
        }
    }

    fn into_events(self, info_hash: InfoHash, out: &mut Vec<EngineEvent>) {
        match self {
            PendingEvent::Upsert {
                status,
                added: true,
            } => out.push(EngineEvent::Added(*status)),
            PendingEvent::Upsert {
                status,
                added: false,
            } => out.push(EngineEvent::Updated(*status)),
            PendingEvent::Removed => out.push(EngineEvent::Removed(info_hash)),
            PendingEvent::Replaced(status) => {
                out.push(EngineEvent::Removed(info_hash));
                out.push(EngineEvent::Added(*status));
            }
        }
    }
}

#[derive(Debug, Default)]
struct PendingEvents {
    slots: HashMap<InfoHash, PendingEvent>,
    order: VecDeque<InfoHash>,
}

impl PendingEvents {
    fn push(&mut self, event: EngineEvent) {
        let info_hash = event.info_hash();
        let merged = match self.slots.remove(&info_hash) {
            Some(existing) => existing.merge(event),
            None => {
                self.order.push_back(info_hash);
                PendingEvent::from_event(event)
            }
        };
        self.slots.insert(info_hash, merged);
    }

    fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::with_capacity(self.order.len());
        while let Some(info_hash) = self.order.pop_front() {
            if let Some(pending) = self.slots.remove(&info_hash) {
                pending.into_events(info_hash, &mut events);
            }
        }
        events
    }
}

/// Creates a connected sink/receiver pair.
///
/// `capacity` bounds outstanding wake-ups, not events; events never queue
/// beyond one merged slot per torrent.
pub fn engine_event_channel(capacity: usize) -> (EngineEventSink, EngineEventReceiver) {
    let pending = Arc::new(Mutex::new(PendingEvents::default()));
    let (wake_sender, wake_receiver) = mpsc::channel(capacity.max(1));

    (
        EngineEventSink {
            pending: Arc::clone(&pending),
            wake: wake_sender,
        },
        EngineEventReceiver {
            pending,
            wake: wake_receiver,
        },
    )
}

/// Callback surface handed to the torrent engine.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    pending: Arc<Mutex<PendingEvents>>,
    wake: mpsc::Sender<()>,
}

impl EngineEventSink {
    pub fn added(&self, status: HandleStatus) {
        self.push(EngineEvent::Added(status));
    }

    pub fn updated(&self, status: HandleStatus) {
        self.push(EngineEvent::Updated(status));
    }

    pub fn removed(&self, info_hash: InfoHash) {
        self.push(EngineEvent::Removed(info_hash));
    }

    /// Queues an event without blocking the calling thread.
    pub fn push(&self, event: EngineEvent) {
        self.pending.lock().push(event);

        match self.wake.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => {
                tracing::debug!("Engine event receiver closed, event stays pending");
            }
        }
    }
}

/// Consumer end, owned by the registry's event worker.
#[derive(Debug)]
pub struct EngineEventReceiver {
    pending: Arc<Mutex<PendingEvents>>,
    wake: mpsc::Receiver<()>,
}

impl EngineEventReceiver {
    /// Waits for a wake-up and returns every pending event.
    ///
    /// Returns `None` once all sinks are dropped and nothing is left.
    pub async fn recv(&mut self) -> Option<Vec<EngineEvent>> {
        loop {
            let woken = self.wake.recv().await;
            let events = self.drain();
            if !events.is_empty() {
                return Some(events);
            }
            woken?;
        }
    }

    /// Takes every pending event without waiting.
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.pending.lock().drain()
    }

    /// Number of torrents with undelivered events.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineTorrentState;

    fn status(byte: u8, received: u64) -> HandleStatus {
        let mut status = HandleStatus::new(InfoHash::new([byte; 20]), "t", 100);
        status.state = EngineTorrentState::Downloading;
        status.bytes_received = received;
        status
    }

    #[test]
    fn test_updates_coalesce_to_latest() {
        let (sink, receiver) = engine_event_channel(4);
        sink.updated(status(1, 10));
        sink.updated(status(1, 20));
        sink.updated(status(1, 30));

        let events = receiver.drain();
        assert_eq!(events, vec![EngineEvent::Updated(status(1, 30))]);
    }

    #[test]
    fn test_added_survives_later_update() {
        let (sink, receiver) = engine_event_channel(4);
        sink.added(status(1, 0));
        sink.updated(status(1, 50));

        let events = receiver.drain();
        assert_eq!(events, vec![EngineEvent::Added(status(1, 50))]);
    }

    #[test]
    fn test_remove_then_add_is_delivered_in_order() {
        let (sink, receiver) = engine_event_channel(4);
        let info_hash = InfoHash::new([1; 20]);
        sink.updated(status(1, 10));
        sink.removed(info_hash);
        sink.added(status(1, 0));

        let events = receiver.drain();
        assert_eq!(
            events,
            vec![
                EngineEvent::Removed(info_hash),
                EngineEvent::Added(status(1, 0))
            ]
        );
    }

    #[test]
    fn test_keys_keep_first_seen_order() {
        let (sink, receiver) = engine_event_channel(4);
        sink.updated(status(2, 1));
        sink.updated(status(1, 1));
        sink.updated(status(2, 2));

        let events = receiver.drain();
        let hashes: Vec<_> = events.iter().map(EngineEvent::info_hash).collect();
        assert_eq!(
            hashes,
            vec![InfoHash::new([2; 20]), InfoHash::new([1; 20])]
        );
        assert_eq!(receiver.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_push_never_blocks_when_wakeups_are_full() {
        let (sink, mut receiver) = engine_event_channel(1);
        for received in 0..1000 {
            sink.updated(status((received % 3) as u8, received));
        }

        let events = receiver.recv().await.unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_recv_waits_for_wakeup() {
        let (sink, mut receiver) = engine_event_channel(2);
        let mut recv = tokio_test::task::spawn(receiver.recv());
        tokio_test::assert_pending!(recv.poll());

        sink.updated(status(1, 5));
        assert!(recv.is_woken());
        let events = tokio_test::assert_ready!(recv.poll());
        assert_eq!(events.map(|events| events.len()), Some(1));
    }

    #[tokio::test]
    async fn test_recv_ends_after_sinks_drop() {
        let (sink, mut receiver) = engine_event_channel(2);
        sink.updated(status(1, 1));
        drop(sink);

        assert_eq!(receiver.recv().await.map(|events| events.len()), Some(1));
        assert!(receiver.recv().await.is_none());
    }
}

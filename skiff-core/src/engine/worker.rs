//! Task that drains engine events into the registry.

use std::sync::Weak;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::events::EngineEventReceiver;
use crate::registry::TransferRegistry;

/// Handle to a running event worker.
#[derive(Debug)]
pub struct EventWorker {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EventWorker {
    /// Stops the worker after its current batch and waits for it.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!("Engine event worker ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns the worker applying engine event batches to `registry`.
///
/// The worker holds the registry weakly and stops once the registry is
/// dropped, the sink side closes, or [`EventWorker::shutdown`] is called.
pub fn spawn_event_worker(
    registry: Weak<TransferRegistry>,
    receiver: EngineEventReceiver,
) -> EventWorker {
    let (shutdown, shutdown_receiver) = oneshot::channel();
    let task = tokio::spawn(run_event_loop(registry, receiver, shutdown_receiver));

    EventWorker {
        shutdown: Some(shutdown),
        task,
    }
}

async fn run_event_loop(
    registry: Weak<TransferRegistry>,
    mut receiver: EngineEventReceiver,
    mut shutdown: oneshot::Receiver<()>,
) {
    tracing::debug!("Engine event worker started");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            batch = receiver.recv() => {
                let Some(events) = batch else {
                    break;
                };
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.apply_engine_events(events);
            }
        }
    }

    tracing::debug!("Engine event worker stopped");
}

//! Transfer that resolves a torrent descriptor before the engine takes over.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::header::REFERER;

use super::{
    FailureReason, Generation, SourceScheme, SourceUri, Transfer, TransferError, TransferKey,
    TransferKind, TransferState, TransferStatus,
};
use crate::engine::{DescriptorInfo, EngineError, TorrentEngine};

/// Continuation that takes over a resolved descriptor instead of the engine.
pub trait FetchListener: Send + Sync {
    /// Called once from the resolution task with the raw descriptor bytes.
    fn on_descriptor_fetched(&self, descriptor: Bytes, source: &SourceUri, token: u64);
}

/// Resolution progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Fetching,
    /// Descriptor delivered to the engine or to the listener.
    HandedOff,
    Errored(FailureReason),
    Canceled,
}

impl FetchPhase {
    fn transfer_state(self) -> TransferState {
        match self {
            FetchPhase::Fetching => TransferState::Resolving,
            FetchPhase::Errored(reason) => TransferState::Errored(reason),
            FetchPhase::HandedOff | FetchPhase::Canceled => TransferState::Removed,
        }
    }
}

/// What a resolution task needs from the registry.
#[derive(Clone)]
pub struct ResolveContext {
    pub engine: Arc<dyn TorrentEngine>,
    pub http: reqwest::Client,
    pub http_timeout: Duration,
    pub magnet_timeout: Duration,
    /// Largest descriptor accepted from an HTTP or local source.
    pub max_descriptor_bytes: u64,
}

/// A torrent whose descriptor is still being fetched from its source.
pub struct FetchingTransfer {
    key: TransferKey,
    source: SourceUri,
    generation: Generation,
    created: DateTime<Utc>,
    token: u64,
    relative_path: Option<String>,
    referrer: Option<String>,
    listener: Option<Arc<dyn FetchListener>>,
    phase: Mutex<FetchPhase>,
    status: RwLock<Arc<TransferStatus>>,
}

impl FetchingTransfer {
    pub fn new(
        generation: Generation,
        source: SourceUri,
        display_name: Option<String>,
        relative_path: Option<String>,
        referrer: Option<String>,
        listener: Option<Arc<dyn FetchListener>>,
    ) -> Self {
        let display_name = display_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| source.to_string());
        let status = TransferStatus::new(display_name, TransferState::Resolving, 0);

        Self {
            key: TransferKey::Source(source.clone()),
            source,
            generation,
            created: Utc::now(),
            token: rand::random::<u64>(),
            relative_path,
            referrer,
            listener,
            phase: Mutex::new(FetchPhase::Fetching),
            status: RwLock::new(Arc::new(status)),
        }
    }

    pub fn source(&self) -> &SourceUri {
        &self.source
    }

    /// Random token passed to the listener to correlate the hand-off.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn phase(&self) -> FetchPhase {
        *self.phase.lock()
    }

    pub fn is_canceled(&self) -> bool {
        self.phase() == FetchPhase::Canceled
    }

    pub fn listener(&self) -> Option<Arc<dyn FetchListener>> {
        self.listener.clone()
    }

    /// Leaves `Fetching` for `next`; false if the fetch already ended.
    pub fn finish(&self, next: FetchPhase) -> bool {
        let mut phase = self.phase.lock();
        if *phase != FetchPhase::Fetching {
            return false;
        }
        *phase = next;
        let mut status = self.status.write();
        *status = Arc::new(status.with_state(next.transfer_state()));
        true
    }

    /// Downloads the descriptor from the source.
    ///
    /// # Errors
    /// - `TransferError::ResolutionTimeout` - Source did not answer in time
    /// - `TransferError::ResolutionFailed` - Source answered with an error or unreadable data
    /// - `TransferError::EngineUnavailable` - Magnet resolution needs a running engine
    pub async fn resolve(&self, context: &ResolveContext) -> Result<Bytes, TransferError> {
        let uri = self.source.as_str();
        match self.source.scheme() {
            SourceScheme::Http | SourceScheme::Https => {
                let mut request = context.http.get(uri).timeout(context.http_timeout);
                if let Some(referrer) = &self.referrer {
                    request = request.header(REFERER, referrer);
                }
                let mut response = request
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .map_err(|e| http_error(uri, e))?;

                let limit = context.max_descriptor_bytes;
                if let Some(length) = response.content_length() {
                    if length > limit {
                        return Err(oversized(uri, limit));
                    }
                }
                let mut body = BytesMut::new();
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|e| http_error(uri, e))?
                {
                    if (body.len() + chunk.len()) as u64 > limit {
                        return Err(oversized(uri, limit));
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(body.freeze())
            }
            SourceScheme::Magnet => {
                // Outer bound in case the engine ignores its own timeout.
                let grace = context.magnet_timeout + Duration::from_secs(1);
                let fetch = context.engine.fetch_magnet(uri, context.magnet_timeout);
                match tokio::time::timeout(grace, fetch).await {
                    Err(_) | Ok(Err(EngineError::MagnetTimeout { .. })) => {
                        Err(TransferError::ResolutionTimeout {
                            uri: uri.to_string(),
                        })
                    }
                    Ok(Err(e)) => Err(TransferError::EngineUnavailable {
                        reason: e.to_string(),
                    }),
                    Ok(Ok(bytes)) => Ok(bytes),
                }
            }
            SourceScheme::File => {
                let path = self
                    .source
                    .file_path()
                    .ok_or_else(|| TransferError::ResolutionFailed {
                        uri: uri.to_string(),
                        reason: "not a local path".to_string(),
                    })?;
                let failed = |e: std::io::Error| TransferError::ResolutionFailed {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                };
                let metadata = tokio::fs::metadata(&path).await.map_err(failed)?;
                if metadata.len() > context.max_descriptor_bytes {
                    return Err(oversized(uri, context.max_descriptor_bytes));
                }
                tokio::fs::read(&path).await.map(Bytes::from).map_err(failed)
            }
        }
    }

    /// File selection for the requested relative path.
    ///
    /// A file is selected when either path ends with the other. `None`
    /// selects everything, including when nothing matches.
    pub fn selection(&self, info: &DescriptorInfo) -> Option<Vec<bool>> {
        let wanted = Path::new(self.relative_path.as_deref()?);
        let selection: Vec<bool> = info
            .files
            .iter()
            .map(|file| wanted.ends_with(&file.path) || file.path.ends_with(wanted))
            .collect();

        if selection.iter().any(|selected| *selected) {
            Some(selection)
        } else {
            tracing::warn!(
                "No file in {} matches {}, selecting all",
                info.name,
                wanted.display()
            );
            None
        }
    }
}

fn oversized(uri: &str, limit: u64) -> TransferError {
    TransferError::ResolutionFailed {
        uri: uri.to_string(),
        reason: format!("descriptor larger than {limit} bytes"),
    }
}

fn http_error(uri: &str, error: reqwest::Error) -> TransferError {
    if error.is_timeout() {
        TransferError::ResolutionTimeout {
            uri: uri.to_string(),
        }
    } else {
        TransferError::ResolutionFailed {
            uri: uri.to_string(),
            reason: error.to_string(),
        }
    }
}

impl fmt::Debug for FetchingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchingTransfer")
            .field("source", &self.source)
            .field("generation", &self.generation)
            .field("phase", &self.phase())
            .finish()
    }
}

#[async_trait]
impl Transfer for FetchingTransfer {
    fn key(&self) -> &TransferKey {
        &self.key
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn kind(&self) -> TransferKind {
        TransferKind::Fetching
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn status(&self) -> Arc<TransferStatus> {
        Arc::clone(&self.status.read())
    }

    fn mark_removed(&self) -> bool {
        let mut phase = self.phase.lock();
        match *phase {
            FetchPhase::Canceled | FetchPhase::HandedOff => false,
            FetchPhase::Fetching | FetchPhase::Errored(_) => {
                *phase = FetchPhase::Canceled;
                let mut status = self.status.write();
                *status = Arc::new(status.with_state(TransferState::Removed));
                true
            }
        }
    }

    async fn release(&self, _delete_data: bool) -> Result<(), TransferError> {
        // The resolution task sees `Canceled` and drops its result.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::engine::{DescriptorFile, SimulatedEngine, SimulatedTorrent, engine_event_channel};
    use crate::transfer::InfoHash;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fetching(uri: &str, relative_path: Option<&str>) -> FetchingTransfer {
        FetchingTransfer::new(
            Generation(1),
            SourceUri::parse(uri).unwrap(),
            None,
            relative_path.map(str::to_string),
            None,
            None,
        )
    }

    fn context(engine: Arc<SimulatedEngine>) -> ResolveContext {
        ResolveContext {
            engine,
            http: reqwest::Client::new(),
            http_timeout: Duration::from_secs(1),
            magnet_timeout: Duration::from_millis(50),
            max_descriptor_bytes: 1024,
        }
    }

    /// Serves one response and returns its URL. Without a length the body
    /// ends when the connection closes.
    async fn serve_once(body: Vec<u8>, with_length: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = if with_length {
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
            } else {
                "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_string()
            };
            socket.write_all(head.as_bytes()).await.unwrap();
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{address}/big.torrent")
    }

    #[test]
    fn test_starts_resolving() {
        let transfer = fetching("https://example.com/a.torrent", None);
        assert_eq!(transfer.state(), TransferState::Resolving);
        assert_eq!(transfer.display_name(), "https://example.com/a.torrent");
        assert!(!transfer.is_pausable());
    }

    #[test]
    fn test_cancel_wins_over_late_result() {
        let transfer = fetching("https://example.com/a.torrent", None);
        assert!(transfer.mark_removed());
        assert!(!transfer.finish(FetchPhase::HandedOff));
        assert_eq!(transfer.phase(), FetchPhase::Canceled);
        assert_eq!(transfer.state(), TransferState::Removed);
        assert!(!transfer.mark_removed());
    }

    #[test]
    fn test_errored_fetch_can_be_removed() {
        let transfer = fetching("https://example.com/a.torrent", None);
        assert!(transfer.finish(FetchPhase::Errored(FailureReason::ResolutionTimeout)));
        assert_eq!(
            transfer.state(),
            TransferState::Errored(FailureReason::ResolutionTimeout)
        );
        assert!(transfer.mark_removed());
    }

    #[test]
    fn test_selection_matches_path_suffix() {
        let transfer = fetching(
            "https://example.com/a.torrent",
            Some("album/cd2/track01.flac"),
        );
        let info = DescriptorInfo {
            info_hash: InfoHash::new([1; 20]),
            name: "album".to_string(),
            total_size: 20,
            files: vec![
                DescriptorFile {
                    path: PathBuf::from("album/cd1/track01.flac"),
                    size: 10,
                },
                DescriptorFile {
                    path: PathBuf::from("album/cd2/track01.flac"),
                    size: 10,
                },
            ],
        };
        assert_eq!(transfer.selection(&info), Some(vec![false, true]));

        let unmatched = fetching("https://example.com/a.torrent", Some("other.flac"));
        assert_eq!(unmatched.selection(&info), None);
    }

    #[tokio::test]
    async fn test_resolve_magnet_through_engine() {
        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let torrent = SimulatedTorrent::new("file.bin", &[("file.bin", 64)]);
        engine.seed_swarm(&torrent);

        let transfer = fetching(&torrent.magnet_uri(), None);
        let bytes = transfer.resolve(&context(engine)).await.unwrap();
        assert_eq!(bytes, torrent.descriptor);
    }

    #[tokio::test]
    async fn test_resolve_magnet_timeout() {
        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let torrent = SimulatedTorrent::new("file.bin", &[("file.bin", 64)]);

        let transfer = fetching(&torrent.magnet_uri(), None);
        let result = transfer.resolve(&context(engine)).await;
        assert!(matches!(
            result,
            Err(TransferError::ResolutionTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.torrent");
        std::fs::write(&path, b"d4:infod4:name1:aee").unwrap();

        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let uri = url::Url::from_file_path(&path).unwrap().to_string();
        let transfer = fetching(&uri, None);

        let bytes = transfer.resolve(&context(engine)).await.unwrap();
        assert_eq!(bytes.as_ref(), b"d4:infod4:name1:aee");
    }

    #[tokio::test]
    async fn test_resolve_http_within_limit() {
        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let url = serve_once(b"d4:infod4:name1:aee".to_vec(), false).await;

        let bytes = fetching(&url, None).resolve(&context(engine)).await.unwrap();
        assert_eq!(bytes.as_ref(), b"d4:infod4:name1:aee");
    }

    #[tokio::test]
    async fn test_resolve_rejects_oversized_descriptor() {
        let (sink, _receiver) = engine_event_channel(8);
        let engine = Arc::new(SimulatedEngine::new(sink));
        let context = context(engine);

        for with_length in [true, false] {
            let url = serve_once(vec![b'x'; 4096], with_length).await;
            let result = fetching(&url, None).resolve(&context).await;
            assert!(
                matches!(result, Err(TransferError::ResolutionFailed { .. })),
                "with_length={with_length}: {result:?}"
            );
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.torrent");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();
        let uri = url::Url::from_file_path(&path).unwrap().to_string();
        let result = fetching(&uri, None).resolve(&context).await;
        assert!(matches!(
            result,
            Err(TransferError::ResolutionFailed { .. })
        ));
    }
}

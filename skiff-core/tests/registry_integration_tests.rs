//! Integration tests for the transfer registry.
//!
//! Each test drives a started registry through its public API against the
//! simulated engine, with the event worker applying engine reports in the
//! background.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use skiff_core::config::SkiffConfig;
use skiff_core::engine::{
    EngineEventSink, SimulatedCommand, SimulatedEngine, SimulatedTorrent, engine_event_channel,
};
use skiff_core::notify::RecordingNotifier;
use skiff_core::policy::StaticPolicy;
use skiff_core::registry::TransferRegistry;
use skiff_core::request::{DownloadOutcome, DownloadRequest};
use skiff_core::transfer::{
    FailureReason, FetchListener, RejectionReason, SourceUri, Transfer, TransferEntry,
    TransferError, TransferKey, TransferKind, TransferState,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Started registry wired to a simulated engine and a settable policy.
struct RegistryFixture {
    registry: Arc<TransferRegistry>,
    engine: Arc<SimulatedEngine>,
    policy: Arc<StaticPolicy>,
    notifier: Arc<RecordingNotifier>,
    sink: EngineEventSink,
    downloads: TempDir,
}

impl RegistryFixture {
    fn new() -> Self {
        Self::with_config(SkiffConfig::for_testing())
    }

    fn with_config(mut config: SkiffConfig) -> Self {
        let downloads = tempfile::tempdir().unwrap();
        config.policy.destination = downloads.path().to_path_buf();

        let (sink, events) = engine_event_channel(config.registry.event_channel_capacity);
        let engine = Arc::new(SimulatedEngine::new(sink.clone()));
        let policy = Arc::new(StaticPolicy::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let registry = TransferRegistry::start(
            config,
            engine.clone(),
            policy.clone(),
            notifier.clone(),
            events,
        )
        .unwrap();

        Self {
            registry,
            engine,
            policy,
            notifier,
            sink,
            downloads,
        }
    }

    async fn add(&self, torrent: &SimulatedTorrent) -> TransferEntry {
        match self
            .registry
            .download(DownloadRequest::descriptor(torrent.descriptor.clone()))
            .await
        {
            DownloadOutcome::Admitted(entry) => entry,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    fn started(&self, torrent: &SimulatedTorrent) -> usize {
        self.engine
            .commands()
            .iter()
            .filter(|command| **command == SimulatedCommand::Start(torrent.info_hash()))
            .count()
    }
}

/// Polls `condition` until it holds or two seconds pass.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Serves `body` to the first HTTP request on a local port.
async fn serve_once(body: Vec<u8>, path: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 2048];
        let _ = socket.read(&mut request).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        socket.flush().await.unwrap();
    });
    format!("http://{address}{path}")
}

#[derive(Default)]
struct CapturingListener {
    received: Mutex<Vec<(Bytes, String, u64)>>,
}

impl FetchListener for CapturingListener {
    fn on_descriptor_fetched(&self, descriptor: Bytes, source: &SourceUri, token: u64) {
        self.received
            .lock()
            .push((descriptor, source.to_string(), token));
    }
}

#[tokio::test]
async fn test_concurrent_same_key_downloads_admit_once() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("ubuntu.iso", &[("ubuntu.iso", 4096)]);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = fixture.registry.clone();
        let descriptor = torrent.descriptor.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .download(DownloadRequest::descriptor(descriptor))
                .await
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap() {
            DownloadOutcome::Admitted(_) => admitted += 1,
            DownloadOutcome::Existing(entry) => {
                assert_eq!(entry.key(), &TransferKey::Torrent(torrent.info_hash()));
            }
            DownloadOutcome::Rejected(rejected) => panic!("unexpected rejection {rejected:?}"),
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(fixture.registry.len(), 1);
    assert_eq!(fixture.started(&torrent), 1);
}

#[tokio::test]
async fn test_removed_torrent_never_reappears_for_its_generation() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("movie.mkv", &[("movie.mkv", 10_000)]);
    let entry = fixture.add(&torrent).await;
    fixture.engine.advance(torrent.info_hash(), 1000);
    let stale = fixture.engine.handle(torrent.info_hash()).unwrap();

    assert!(fixture.registry.remove(&entry, false));

    // Reports the engine emitted before it saw the removal.
    fixture.sink.updated(stale.clone());
    fixture.sink.added(stale);

    let key = TransferKey::Torrent(torrent.info_hash());
    for _ in 0..20 {
        assert!(fixture.registry.get(&key).is_none());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(
        eventually(|| !fixture.registry.is_tombstoned(torrent.info_hash())).await,
        "engine removal never confirmed"
    );
    assert!(fixture.registry.get(&key).is_none());
    assert_eq!(entry.state(), TransferState::Removed);
    assert_eq!(fixture.engine.handle_count(), 0);
}

#[tokio::test]
async fn test_byte_counters_monotonic_while_downloading() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("big.bin", &[("big.bin", 1_000_000)]);
    let entry = fixture.add(&torrent).await;
    let info_hash = torrent.info_hash();

    let early = {
        fixture.engine.advance(info_hash, 10_000);
        fixture.engine.handle(info_hash).unwrap()
    };

    let reader = {
        let entry = entry.clone();
        tokio::spawn(async move {
            let mut last = 0;
            for _ in 0..200 {
                let received = entry.bytes_received();
                assert!(received >= last, "bytes went from {last} to {received}");
                last = received;
                tokio::task::yield_now().await;
            }
            last
        })
    };

    for _ in 0..50 {
        fixture.engine.advance(info_hash, 10_000);
        // An out-of-order report carrying older counters.
        fixture.sink.updated(early.clone());
        tokio::task::yield_now().await;
    }

    reader.await.unwrap();
    assert!(eventually(|| entry.bytes_received() == 510_000).await);
    assert_eq!(entry.state(), TransferState::Downloading);
}

#[tokio::test]
async fn test_pause_all_leaves_nothing_downloading() {
    let fixture = RegistryFixture::new();
    let torrents: Vec<_> = (0..3)
        .map(|i| {
            let name = format!("file{i}.bin");
            SimulatedTorrent::new(&name, &[(&name, 1000)])
        })
        .collect();
    for torrent in &torrents {
        fixture.add(torrent).await;
        fixture.engine.advance(torrent.info_hash(), 100);
    }
    assert!(
        eventually(|| fixture
            .registry
            .snapshot()
            .iter()
            .all(|snapshot| snapshot.status.bytes_received == 100))
        .await
    );

    fixture.registry.pause_all().await;
    fixture.engine.advance_all(100);
    for torrent in &torrents {
        fixture.engine.report(torrent.info_hash());
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    for entry in fixture.registry.transfers() {
        assert_ne!(entry.state(), TransferState::Downloading, "{entry:?}");
    }
    assert!(
        fixture
            .registry
            .snapshot()
            .iter()
            .all(|snapshot| snapshot.state() == TransferState::Paused)
    );
}

#[tokio::test]
async fn test_redownload_after_remove_gets_fresh_generation() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("album", &[("a.flac", 500), ("b.flac", 500)]);
    let first = fixture.add(&torrent).await;

    assert!(fixture.registry.remove(&first, false));
    let second = fixture.add(&torrent).await;

    assert!(!second.same_instance(&first));
    assert!(second.generation() > first.generation());
    assert_eq!(first.state(), TransferState::Removed);

    fixture.engine.advance(torrent.info_hash(), 200);
    assert!(eventually(|| second.bytes_received() == 200).await);

    let key = TransferKey::Torrent(torrent.info_hash());
    let live = fixture.registry.get(&key).unwrap();
    assert!(live.same_instance(&second));
    assert_eq!(live.state(), TransferState::Downloading);
    assert_eq!(first.bytes_received(), 0);
}

#[tokio::test]
async fn test_magnet_resolves_into_single_torrent_entry() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("debian.iso", &[("debian.iso", 2048)]);
    fixture.engine.seed_swarm(&torrent);
    fixture.engine.set_magnet_delay(Duration::from_millis(50));

    let outcome = fixture
        .registry
        .download(DownloadRequest::torrent(torrent.magnet_uri()))
        .await;
    let fetching = outcome.entry().unwrap().clone();
    assert!(outcome.is_admitted());
    assert_eq!(fetching.kind(), TransferKind::Fetching);
    assert_eq!(fetching.state(), TransferState::Resolving);
    assert_eq!(fetching.display_name(), "debian.iso");

    let key = TransferKey::Torrent(torrent.info_hash());
    assert!(eventually(|| fixture.registry.get(&key).is_some()).await);

    let transfers = fixture.registry.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].key(), &key);
    assert_eq!(transfers[0].state(), TransferState::Downloading);
    assert_eq!(fetching.state(), TransferState::Removed);

    let again = fixture
        .registry
        .download(DownloadRequest::torrent(torrent.magnet_uri()))
        .await;
    assert!(again.is_existing());
    assert!(again.entry().unwrap().same_instance(&transfers[0]));
}

#[tokio::test]
async fn test_metered_data_savings_rejects_without_inserting() {
    let fixture = RegistryFixture::new();
    fixture.policy.set_metered(true);
    fixture.policy.set_data_savings(true);
    let torrent = SimulatedTorrent::new("show.mkv", &[("show.mkv", 100)]);

    let outcome = fixture
        .registry
        .download(DownloadRequest::descriptor(torrent.descriptor.clone()))
        .await;
    let rejected = outcome.rejected().unwrap();
    assert_eq!(rejected.reason(), RejectionReason::MeteredNetworkTorrent);
    assert_eq!(
        rejected.state(),
        TransferState::Errored(FailureReason::PolicyRejected(
            RejectionReason::MeteredNetworkTorrent
        ))
    );

    let magnet = fixture
        .registry
        .download(DownloadRequest::torrent(torrent.magnet_uri()))
        .await;
    assert_eq!(
        magnet.rejected().map(|r| r.reason()),
        Some(RejectionReason::MeteredNetworkTorrent)
    );

    let unsized_http = fixture
        .registry
        .download(DownloadRequest::http("https://example.com/a.zip", None))
        .await;
    assert_eq!(
        unsized_http.rejected().map(|r| r.reason()),
        Some(RejectionReason::MeteredNetworkHttp)
    );

    let large_http = fixture
        .registry
        .download(DownloadRequest::http(
            "https://example.com/b.zip",
            Some(512 * 1024 * 1024),
        ))
        .await;
    assert!(large_http.rejected().is_some());

    assert!(fixture.registry.is_empty());
    assert!(fixture.engine.commands().is_empty());
    assert_eq!(fixture.registry.started_transfers(), 0);
}

#[tokio::test]
async fn test_update_for_unknown_torrent_creates_entry() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("restored.bin", &[("restored.bin", 300)]);
    let mut status =
        skiff_core::engine::HandleStatus::new(torrent.info_hash(), "restored.bin", 300);
    status.state = skiff_core::engine::EngineTorrentState::Downloading;
    status.bytes_received = 120;

    fixture.sink.updated(status);

    let key = TransferKey::Torrent(torrent.info_hash());
    assert!(eventually(|| fixture.registry.get(&key).is_some()).await);
    let entry = fixture.registry.get(&key).unwrap();
    assert_eq!(entry.state(), TransferState::Downloading);
    assert_eq!(entry.bytes_received(), 120);
    assert_eq!(entry.progress(), 40);
}

#[tokio::test]
async fn test_insufficient_space_admits_in_disk_full() {
    let fixture = RegistryFixture::new();
    fixture.policy.set_available_bytes(100);
    let torrent = SimulatedTorrent::new("huge.bin", &[("huge.bin", 5000)]);

    let entry = fixture.add(&torrent).await;
    assert_eq!(entry.state(), TransferState::Errored(FailureReason::DiskFull));
    assert!(
        fixture
            .engine
            .commands()
            .contains(&SimulatedCommand::Pause(torrent.info_hash()))
    );
    assert!(fixture.notifier.wait_for(1, Duration::from_secs(1)).await);
    assert_eq!(fixture.notifier.errored_count(), 1);

    // Engine reports do not lift the hold.
    fixture.engine.report(torrent.info_hash());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(entry.state(), TransferState::Errored(FailureReason::DiskFull));

    let refused = entry.resume().await;
    assert!(matches!(
        refused,
        Err(TransferError::DiskFull {
            required: 5000,
            available: 100
        })
    ));

    fixture.policy.set_available_bytes(u64::MAX);
    entry.resume().await.unwrap();
    assert_eq!(entry.state(), TransferState::Downloading);
}

#[tokio::test]
async fn test_listener_takes_over_resolved_descriptor() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("handoff.bin", &[("handoff.bin", 64)]);
    fixture.engine.seed_swarm(&torrent);
    let listener = Arc::new(CapturingListener::default());

    let outcome = fixture
        .registry
        .download(DownloadRequest::Torrent {
            uri: torrent.magnet_uri(),
            display_name: None,
            relative_path: None,
            referrer: None,
            listener: Some(listener.clone()),
        })
        .await;
    let fetching = outcome.into_entry().unwrap();

    assert!(eventually(|| !listener.received.lock().is_empty()).await);
    let (descriptor, source, _token) = listener.received.lock()[0].clone();
    assert_eq!(descriptor, torrent.descriptor);
    assert_eq!(
        source,
        format!("magnet:?xt=urn:btih:{}", torrent.info_hash())
    );

    assert!(fixture.registry.is_empty());
    assert_eq!(fetching.state(), TransferState::Removed);
    assert_eq!(fixture.started(&torrent), 0);
}

#[tokio::test]
async fn test_remove_during_fetch_cancels_start() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("slow.bin", &[("slow.bin", 64)]);
    fixture.engine.seed_swarm(&torrent);
    fixture.engine.set_magnet_delay(Duration::from_millis(100));

    let fetching = fixture
        .registry
        .download(DownloadRequest::torrent(torrent.magnet_uri()))
        .await
        .into_entry()
        .unwrap();
    assert!(fixture.registry.remove(&fetching, false));
    assert_eq!(fetching.state(), TransferState::Removed);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(fixture.registry.is_empty());
    assert_eq!(fixture.started(&torrent), 0);
}

#[tokio::test]
async fn test_magnet_timeout_errors_and_allows_retry() {
    let mut config = SkiffConfig::for_testing();
    config.registry.magnet_timeout = Duration::from_millis(50);
    let fixture = RegistryFixture::with_config(config);
    let torrent = SimulatedTorrent::new("lost.bin", &[("lost.bin", 64)]);

    let first = fixture
        .registry
        .download(DownloadRequest::torrent(torrent.magnet_uri()))
        .await
        .into_entry()
        .unwrap();
    assert!(eventually(|| first.state().is_errored()).await);
    assert_eq!(
        first.state(),
        TransferState::Errored(FailureReason::ResolutionTimeout)
    );
    assert!(fixture.notifier.wait_for(1, Duration::from_secs(1)).await);

    fixture.engine.seed_swarm(&torrent);
    let retry = fixture
        .registry
        .download(DownloadRequest::torrent(torrent.magnet_uri()))
        .await;
    assert!(retry.is_admitted());
    assert_eq!(first.state(), TransferState::Removed);

    let key = TransferKey::Torrent(torrent.info_hash());
    assert!(eventually(|| fixture.registry.get(&key).is_some()).await);
    assert_eq!(fixture.registry.len(), 1);
}

#[tokio::test]
async fn test_unsupported_and_malformed_uris_are_rejected() {
    let fixture = RegistryFixture::new();

    let ftp = fixture
        .registry
        .download(DownloadRequest::torrent("ftp://example.com/a.torrent"))
        .await;
    assert_eq!(
        ftp.rejected().map(|r| r.reason()),
        Some(RejectionReason::UnsupportedScheme)
    );

    let garbage = fixture
        .registry
        .download(DownloadRequest::torrent("definitely not a link"))
        .await;
    assert_eq!(
        garbage.rejected().map(|r| r.reason()),
        Some(RejectionReason::MalformedUri)
    );

    let magnet_http = fixture
        .registry
        .download(DownloadRequest::http("magnet:?xt=urn:btih:abc", None))
        .await;
    assert!(magnet_http.rejected().is_some());

    let junk = fixture
        .registry
        .download(DownloadRequest::descriptor(Bytes::from_static(b"not bencode")))
        .await;
    assert_eq!(
        junk.rejected().map(|r| r.reason()),
        Some(RejectionReason::InvalidDescriptor)
    );

    assert!(fixture.registry.is_empty());
}

#[tokio::test]
async fn test_over_encoded_magnet_matches_live_torrent() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("dup.bin", &[("dup.bin", 64)]);
    let entry = fixture.add(&torrent).await;

    let encoded = format!("magnet:?xt=urn%3Abtih%3A{}", torrent.info_hash());
    let outcome = fixture
        .registry
        .download(DownloadRequest::torrent(encoded))
        .await;

    assert!(outcome.is_existing());
    assert!(outcome.entry().unwrap().same_instance(&entry));
    assert_eq!(fixture.registry.len(), 1);
}

#[tokio::test]
async fn test_local_descriptor_with_relative_path_selects_file() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("album", &[("cd1.flac", 300), ("cd2.flac", 700)]);
    let path = fixture.downloads.path().join("album.torrent");
    std::fs::write(&path, &torrent.descriptor).unwrap();
    let uri = url::Url::from_file_path(&path).unwrap().to_string();

    fixture
        .registry
        .download(DownloadRequest::Torrent {
            uri,
            display_name: None,
            relative_path: Some("album/cd2.flac".to_string()),
            referrer: None,
            listener: None,
        })
        .await;

    assert!(eventually(|| fixture.registry.torrent(torrent.info_hash()).is_some()).await);
    let transfer = fixture.registry.torrent(torrent.info_hash()).unwrap();
    assert!(transfer.is_partial());
    assert_eq!(transfer.status().total_size, 700);
    let items = transfer.items();
    assert_eq!(items.len(), 1);
    assert!(items[0].path.ends_with("cd2.flac"));
}

#[tokio::test]
async fn test_http_descriptor_source_maps_to_torrent() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("web.bin", &[("web.bin", 128)]);
    let url = serve_once(torrent.descriptor.to_vec(), "/web.torrent").await;

    fixture
        .registry
        .download(DownloadRequest::torrent(url.clone()))
        .await;
    assert!(eventually(|| fixture.registry.torrent(torrent.info_hash()).is_some()).await);

    let again = fixture
        .registry
        .download(DownloadRequest::torrent(url))
        .await;
    assert!(again.is_existing());
    assert_eq!(again.entry().unwrap().kind(), TransferKind::Bittorrent);
    assert_eq!(fixture.registry.len(), 1);
}

#[tokio::test]
async fn test_http_file_download_finishes() {
    let fixture = RegistryFixture::new();
    let url = serve_once(b"hello skiff".to_vec(), "/files/notes.txt").await;

    let entry = fixture
        .registry
        .download(DownloadRequest::http(url, Some(11)))
        .await
        .into_entry()
        .unwrap();
    assert_eq!(entry.kind(), TransferKind::Http);
    assert!(!entry.is_pausable());

    assert!(eventually(|| entry.state() == TransferState::Finished).await);
    assert!(entry.is_complete());
    assert_eq!(entry.bytes_received(), 11);
    let written = std::fs::read(fixture.downloads.path().join("notes.txt")).unwrap();
    assert_eq!(written, b"hello skiff");
    assert!(fixture.notifier.wait_for(1, Duration::from_secs(1)).await);
    assert_eq!(fixture.registry.downloads_to_review(), 1);

    fixture.registry.clear_complete();
    assert!(fixture.registry.is_empty());
}

#[tokio::test]
async fn test_seeding_policy_and_counters() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("seed.bin", &[("seed.bin", 100)]);
    let entry = fixture.add(&torrent).await;
    assert_eq!(fixture.registry.active_downloads(), 1);

    fixture.engine.advance(torrent.info_hash(), 100);
    assert!(eventually(|| entry.state() == TransferState::Seeding).await);
    assert_eq!(fixture.registry.active_downloads(), 0);
    assert_eq!(fixture.registry.active_uploads(), 1);
    assert_eq!(fixture.registry.downloads_to_review(), 1);

    fixture.policy.set_seeding_allowed(false);
    let monitor = skiff_core::registry::spawn_policy_monitor(
        &fixture.registry,
        Duration::from_millis(10),
    );
    assert!(eventually(|| entry.state() == TransferState::Paused).await);
    monitor.abort();
    assert_eq!(fixture.registry.active_uploads(), 0);

    fixture.registry.seed_finished().await;
    assert_eq!(entry.state(), TransferState::Paused);

    fixture.policy.set_seeding_allowed(true);
    fixture.registry.seed_finished().await;
    assert_eq!(entry.state(), TransferState::Seeding);

    fixture.registry.stop_seeding().await;
    assert_eq!(entry.state(), TransferState::Paused);

    fixture.registry.clear_complete();
    assert!(fixture.registry.is_empty());
    assert_eq!(fixture.registry.started_transfers(), 1);
    fixture.registry.clear_downloads_to_review();
    assert_eq!(fixture.registry.downloads_to_review(), 0);
}

#[tokio::test]
async fn test_engine_down_marks_torrent_errored() {
    let fixture = RegistryFixture::new();
    fixture.engine.set_available(false);
    let torrent = SimulatedTorrent::new("down.bin", &[("down.bin", 100)]);

    let entry = fixture.add(&torrent).await;
    assert_eq!(
        entry.state(),
        TransferState::Errored(FailureReason::EngineUnavailable)
    );
    assert!(fixture.notifier.wait_for(1, Duration::from_secs(1)).await);

    fixture.registry.force_reannounce_all().await;
    assert!(fixture.registry.remove(&entry, false));
    tokio::time::sleep(Duration::from_millis(20)).await;
    // The engine could not confirm, so only a new download lifts the tombstone.
    assert!(fixture.registry.is_tombstoned(torrent.info_hash()));

    fixture.engine.set_available(true);
    let again = fixture.add(&torrent).await;
    assert!(again.generation() > entry.generation());
    assert!(!fixture.registry.is_tombstoned(torrent.info_hash()));
    assert_eq!(again.state(), TransferState::Downloading);
}

#[tokio::test]
async fn test_report_queued_before_pause_does_not_undo_it() {
    let fixture = RegistryFixture::new();
    let torrent = SimulatedTorrent::new("queued.bin", &[("queued.bin", 1000)]);
    let entry = fixture.add(&torrent).await;
    fixture.engine.advance(torrent.info_hash(), 100);
    assert!(eventually(|| entry.bytes_received() == 100).await);

    // Emitted by the engine before it processed the pause.
    fixture
        .sink
        .updated(fixture.engine.handle(torrent.info_hash()).unwrap());
    entry.pause().await.unwrap();
    assert_eq!(entry.state(), TransferState::Paused);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(entry.state(), TransferState::Paused);
    assert!(
        fixture
            .registry
            .is_resumable(fixture.registry.torrent(torrent.info_hash()).unwrap().as_ref())
    );
}

//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use skiff_core::config::SkiffConfig;
use skiff_core::engine::{SimulatedEngine, SimulatedTorrent, engine_event_channel, parse_descriptor};
use skiff_core::notify::LogNotifier;
use skiff_core::policy::{NetworkState, SystemPolicy};
use skiff_core::registry::{TransferRegistry, spawn_policy_monitor};
use skiff_core::transfer::format_bytes_per_second;
use skiff_core::{DownloadOutcome, DownloadRequest, Transfer, TransferSnapshot};
use tokio::time::Instant;
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a registry against the simulated engine and report its transfers
    Run(RunArgs),
    /// Print what a .torrent file describes
    Inspect {
        /// Path to the torrent file
        file: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Options for a simulated registry session.
#[derive(Args)]
pub struct RunArgs {
    /// Magnet links, torrent URLs or paths to .torrent files
    sources: Vec<String>,

    /// Plain HTTP file downloads
    #[arg(long = "http")]
    http: Vec<String>,

    /// Generated torrents to fetch by magnet from the simulated swarm
    #[arg(long, default_value = "0")]
    demo: usize,

    /// Download directory override
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// How long to run before printing the final state
    #[arg(long, default_value = "5")]
    duration_secs: u64,

    /// Interval between simulated engine progress steps
    #[arg(long, default_value = "250")]
    tick_ms: u64,

    /// Bytes each active torrent receives per step
    #[arg(long, default_value = "262144")]
    step_bytes: u64,

    /// Pretend the network is metered
    #[arg(long)]
    metered: bool,

    /// Refuse heavy downloads while metered
    #[arg(long)]
    data_savings: bool,

    /// Stop uploading once torrents finish
    #[arg(long)]
    no_seeding: bool,

    /// Print the final transfers as JSON
    #[arg(long)]
    json: bool,
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run_registry(args).await,
        Commands::Inspect { file, json } => inspect_descriptor(&file, json).await,
    }
}

/// Runs a registry session against the simulated engine
///
/// # Errors
/// - Registry could not start outside a runtime or without an HTTP client
/// - A torrent file could not be read
/// - No sources were given
pub async fn run_registry(args: RunArgs) -> Result<()> {
    let mut config = SkiffConfig::from_env();
    if let Some(output) = args.output {
        config.policy.destination = output;
    }
    config.policy.data_savings |= args.data_savings;
    if args.no_seeding {
        config.policy.seed_finished_torrents = false;
    }

    let network = Arc::new(NetworkState::default());
    network.set(args.metered, !args.metered);
    let policy = Arc::new(SystemPolicy::new(config.policy.clone(), network));

    let (sink, events) = engine_event_channel(config.registry.event_channel_capacity);
    let engine = Arc::new(SimulatedEngine::new(sink));
    let monitor_interval = config.registry.policy_monitor_interval;
    let engine_settings = config.engine.clone();

    let registry = TransferRegistry::start(
        config,
        engine.clone(),
        policy,
        Arc::new(LogNotifier),
        events,
    )
    .context("Failed to start transfer registry")?;
    registry.apply_engine_settings(&engine_settings).await;
    let monitor = spawn_policy_monitor(&registry, monitor_interval);
    info!(
        metered = args.metered,
        duration_secs = args.duration_secs,
        "Registry session started"
    );

    let mut requests = Vec::new();
    for source in &args.sources {
        requests.push(request_for(source).await?);
    }
    for url in &args.http {
        requests.push(DownloadRequest::http(url.clone(), None));
    }
    for index in 0..args.demo {
        let torrent = demo_torrent(index);
        engine.seed_swarm(&torrent);
        requests.push(DownloadRequest::torrent(torrent.magnet_uri()));
    }
    if requests.is_empty() {
        bail!("Nothing to download; pass sources, --http or --demo");
    }

    for request in requests {
        match registry.download(request).await {
            DownloadOutcome::Admitted(entry) => {
                println!("Admitted {} ({})", entry.display_name(), entry.key());
            }
            DownloadOutcome::Existing(entry) => {
                println!("Already tracking {}", entry.display_name());
            }
            DownloadOutcome::Rejected(rejected) => {
                warn!(name = %rejected.display_name(), "Download rejected");
                println!(
                    "Rejected {}: {}",
                    rejected.display_name(),
                    rejected.user_message()
                );
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if Instant::now() >= deadline {
                    break;
                }
                engine.advance_all(args.step_bytes);
                for snapshot in registry.snapshot() {
                    if let Some(info_hash) = snapshot.key.info_hash() {
                        if snapshot.state() == skiff_core::TransferState::Seeding {
                            engine.upload(info_hash, args.step_bytes / 4);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break;
            }
        }
    }

    monitor.abort();
    let snapshots = registry.snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    } else {
        print_table(&snapshots);
        println!();
        println!(
            "Active: {} down, {} up | {} / {} | {} to review",
            registry.active_downloads(),
            registry.active_uploads(),
            format_bytes_per_second(registry.downloads_bandwidth()),
            format_bytes_per_second(registry.uploads_bandwidth()),
            registry.downloads_to_review()
        );
    }

    registry.shutdown().await;
    info!("Registry session finished");
    Ok(())
}

/// Print what a torrent file describes
///
/// # Errors
/// - File could not be read
/// - File is not a valid torrent descriptor
pub async fn inspect_descriptor(file: &Path, json: bool) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let info = parse_descriptor(&bytes)
        .with_context(|| format!("{} is not a torrent file", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Name:      {}", info.name);
    println!("Info hash: {}", info.info_hash);
    println!("Size:      {:.2} MB", info.total_size as f64 / 1_048_576.0);
    println!("Magnet:    magnet:?xt=urn:btih:{}", info.info_hash);
    println!("Files:");
    for file in &info.files {
        println!("  {:>12}  {}", file.size, file.path.display());
    }
    Ok(())
}

async fn request_for(source: &str) -> Result<DownloadRequest> {
    let path = Path::new(source);
    if path.is_file() {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(DownloadRequest::descriptor(bytes));
    }
    Ok(DownloadRequest::torrent(source))
}

fn demo_torrent(index: usize) -> SimulatedTorrent {
    let name = format!("skiff-demo-{index}");
    let size = 2 * 1024 * 1024 * (index as u64 + 1);
    SimulatedTorrent::new(&name, &[("video.mp4", size), ("README.txt", 4096)])
}

fn print_table(snapshots: &[TransferSnapshot]) {
    println!(
        "{:<32} {:<10} {:<22} {:>5} {:>12} {:>12}",
        "NAME", "KIND", "STATE", "%", "RECEIVED", "RATE"
    );
    println!("{:-<98}", "");
    if snapshots.is_empty() {
        println!("No transfers.");
        return;
    }
    for snapshot in snapshots {
        let status = &snapshot.status;
        let mut name = status.display_name.clone();
        if name.chars().count() > 32 {
            name = name.chars().take(29).collect::<String>() + "...";
        }
        println!(
            "{:<32} {:<10} {:<22} {:>5} {:>12} {:>12}",
            name,
            format!("{:?}", snapshot.kind).to_lowercase(),
            snapshot.state().to_string(),
            status.progress,
            status.bytes_received,
            snapshot.download_rate_display
        );
    }
}

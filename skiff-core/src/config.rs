//! Centralized configuration for Skiff.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineLimit;

/// Central configuration for all Skiff components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SkiffConfig {
    pub registry: RegistryConfig,
    pub engine: EngineSettings,
    pub policy: PolicySettings,
}

/// Transfer registry behaviour.
///
/// Controls the engine event channel, descriptor resolution timeouts and
/// the background policy sweep.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Outstanding engine wake-ups before further pushes coalesce
    pub event_channel_capacity: usize,
    /// Timeout for fetching a torrent descriptor over HTTP
    pub http_timeout: Duration,
    /// Timeout for resolving magnet metadata through the engine
    pub magnet_timeout: Duration,
    /// Largest torrent descriptor read from a URL or local file
    pub max_descriptor_bytes: u64,
    /// Largest HTTP download admitted on a metered network with data savings on
    pub metered_http_limit_bytes: u64,
    /// How often seeding permission is re-evaluated
    pub policy_monitor_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 64,
            http_timeout: Duration::from_secs(30),
            magnet_timeout: Duration::from_secs(30),
            max_descriptor_bytes: 10 * 1024 * 1024, // 10 MiB
            metered_http_limit_bytes: 10 * 1024 * 1024, // 10 MiB
            policy_monitor_interval: Duration::from_secs(5),
            user_agent: "skiff/0.1.0",
        }
    }
}

/// Engine tuning pushed through `set_limit`.
///
/// Rates are bytes per second; 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub download_rate_limit: u64,
    pub upload_rate_limit: u64,
    pub max_active_downloads: u64,
    pub max_active_seeds: u64,
    pub max_connections: u64,
    pub max_peers: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            download_rate_limit: 0,
            upload_rate_limit: 0,
            max_active_downloads: 4,
            max_active_seeds: 4,
            max_connections: 200,
            max_peers: 50,
        }
    }
}

impl EngineSettings {
    /// Every limit paired with its configured value.
    pub fn limits(&self) -> [(EngineLimit, u64); 6] {
        [
            (EngineLimit::DownloadRate, self.download_rate_limit),
            (EngineLimit::UploadRate, self.upload_rate_limit),
            (EngineLimit::MaxActiveDownloads, self.max_active_downloads),
            (EngineLimit::MaxActiveSeeds, self.max_active_seeds),
            (EngineLimit::MaxConnections, self.max_connections),
            (EngineLimit::MaxPeers, self.max_peers),
        ]
    }
}

/// User preferences consulted by the policy gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySettings {
    /// Keep uploading once a torrent finishes
    pub seed_finished_torrents: bool,
    /// Only seed while on Wi-Fi
    pub seed_on_wifi_only: bool,
    /// Refuse heavy downloads on metered networks
    pub data_savings: bool,
    /// Directory downloads are written to
    pub destination: PathBuf,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            seed_finished_torrents: true,
            seed_on_wifi_only: false,
            data_savings: false,
            destination: PathBuf::from("downloads"),
        }
    }
}

impl SkiffConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_parse::<u64>("SKIFF_HTTP_TIMEOUT") {
            config.registry.http_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("SKIFF_MAGNET_TIMEOUT") {
            config.registry.magnet_timeout = Duration::from_secs(seconds);
        }
        if let Some(bytes) = env_parse::<u64>("SKIFF_MAX_DESCRIPTOR_BYTES") {
            config.registry.max_descriptor_bytes = bytes;
        }
        if let Some(bytes) = env_parse::<u64>("SKIFF_METERED_HTTP_LIMIT") {
            config.registry.metered_http_limit_bytes = bytes;
        }
        if let Some(capacity) = env_parse::<usize>("SKIFF_EVENT_CAPACITY") {
            config.registry.event_channel_capacity = capacity;
        }

        if let Some(rate) = env_parse::<u64>("SKIFF_DOWNLOAD_RATE_LIMIT") {
            config.engine.download_rate_limit = rate;
        }
        if let Some(rate) = env_parse::<u64>("SKIFF_UPLOAD_RATE_LIMIT") {
            config.engine.upload_rate_limit = rate;
        }
        if let Some(count) = env_parse::<u64>("SKIFF_MAX_DOWNLOADS") {
            config.engine.max_active_downloads = count;
        }

        if let Ok(dir) = std::env::var("SKIFF_DOWNLOAD_DIR") {
            config.policy.destination = PathBuf::from(dir);
        }
        if let Ok(value) = std::env::var("SKIFF_SEED_FINISHED") {
            config.policy.seed_finished_torrents = value.parse().unwrap_or(true);
        }
        if let Ok(value) = std::env::var("SKIFF_SEED_WIFI_ONLY") {
            config.policy.seed_on_wifi_only = value.parse().unwrap_or(false);
        }
        if let Ok(value) = std::env::var("SKIFF_DATA_SAVINGS") {
            config.policy.data_savings = value.parse().unwrap_or(false);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            registry: RegistryConfig {
                http_timeout: Duration::from_secs(2),
                magnet_timeout: Duration::from_secs(2),
                policy_monitor_interval: Duration::from_millis(50),
                ..Default::default()
            },
            policy: PolicySettings {
                destination: std::env::temp_dir().join("skiff-test-downloads"),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

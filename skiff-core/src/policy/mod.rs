//! Network, preference and disk-space flags consulted by the policy gates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use sysinfo::Disks;

use crate::config::PolicySettings;

/// Read-only view of the conditions that can veto or force transitions.
///
/// Implementations are queried outside registry locks and may touch the
/// filesystem in `available_bytes_at_destination`.
pub trait PolicySource: Send + Sync {
    fn is_metered_network_active(&self) -> bool;

    fn is_data_savings_enabled(&self) -> bool;

    /// Whether finished torrents may upload on the current network.
    fn is_seeding_allowed_now(&self) -> bool;

    /// Free bytes on the volume downloads are written to.
    fn available_bytes_at_destination(&self) -> u64;

    /// Metered network with data savings on: heavy downloads are refused.
    fn is_metered_and_saving_data(&self) -> bool {
        self.is_metered_network_active() && self.is_data_savings_enabled()
    }
}

/// Settable policy for tests and simulations.
#[derive(Debug)]
pub struct StaticPolicy {
    metered: AtomicBool,
    data_savings: AtomicBool,
    seeding_allowed: AtomicBool,
    available_bytes: AtomicU64,
}

impl Default for StaticPolicy {
    fn default() -> Self {
        Self {
            metered: AtomicBool::new(false),
            data_savings: AtomicBool::new(false),
            seeding_allowed: AtomicBool::new(true),
            available_bytes: AtomicU64::new(u64::MAX),
        }
    }
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::SeqCst);
    }

    pub fn set_data_savings(&self, enabled: bool) {
        self.data_savings.store(enabled, Ordering::SeqCst);
    }

    pub fn set_seeding_allowed(&self, allowed: bool) {
        self.seeding_allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn set_available_bytes(&self, bytes: u64) {
        self.available_bytes.store(bytes, Ordering::SeqCst);
    }
}

impl PolicySource for StaticPolicy {
    fn is_metered_network_active(&self) -> bool {
        self.metered.load(Ordering::SeqCst)
    }

    fn is_data_savings_enabled(&self) -> bool {
        self.data_savings.load(Ordering::SeqCst)
    }

    fn is_seeding_allowed_now(&self) -> bool {
        self.seeding_allowed.load(Ordering::SeqCst)
    }

    fn available_bytes_at_destination(&self) -> u64 {
        self.available_bytes.load(Ordering::SeqCst)
    }
}

/// Connectivity flags maintained by the host's network monitor.
#[derive(Debug)]
pub struct NetworkState {
    metered: AtomicBool,
    wifi: AtomicBool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            metered: AtomicBool::new(false),
            wifi: AtomicBool::new(true),
        }
    }
}

impl NetworkState {
    /// Records a connectivity change, e.g. a Wi-Fi to cellular handover.
    pub fn set(&self, metered: bool, wifi: bool) {
        self.metered.store(metered, Ordering::SeqCst);
        self.wifi.store(wifi, Ordering::SeqCst);
    }

    pub fn is_metered(&self) -> bool {
        self.metered.load(Ordering::SeqCst)
    }

    pub fn is_wifi(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }
}

/// Policy backed by user preferences, live connectivity and real disk space.
#[derive(Debug)]
pub struct SystemPolicy {
    settings: RwLock<PolicySettings>,
    network: Arc<NetworkState>,
}

impl SystemPolicy {
    pub fn new(settings: PolicySettings, network: Arc<NetworkState>) -> Self {
        Self {
            settings: RwLock::new(settings),
            network,
        }
    }

    pub fn network(&self) -> &Arc<NetworkState> {
        &self.network
    }

    /// Applies changed preferences; later queries see them immediately.
    pub fn update_settings(&self, settings: PolicySettings) {
        *self.settings.write() = settings;
    }

    pub fn destination(&self) -> PathBuf {
        self.settings.read().destination.clone()
    }
}

impl PolicySource for SystemPolicy {
    fn is_metered_network_active(&self) -> bool {
        self.network.is_metered()
    }

    fn is_data_savings_enabled(&self) -> bool {
        self.settings.read().data_savings
    }

    fn is_seeding_allowed_now(&self) -> bool {
        let settings = self.settings.read();
        if !settings.seed_finished_torrents {
            return false;
        }
        !settings.seed_on_wifi_only || self.network.is_wifi()
    }

    fn available_bytes_at_destination(&self) -> u64 {
        let destination = self.destination();
        match available_disk_space(&destination) {
            Some(bytes) => bytes,
            None => {
                tracing::warn!(
                    "Could not determine free space for {}, assuming enough",
                    destination.display()
                );
                u64::MAX
            }
        }
    }
}

/// Asks `policy` for free space on the blocking pool, since the lookup may
/// walk mounted volumes.
pub async fn available_space(policy: &Arc<dyn PolicySource>) -> u64 {
    let policy = Arc::clone(policy);
    match tokio::task::spawn_blocking(move || policy.available_bytes_at_destination()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Free space lookup failed, assuming enough: {}", e);
            u64::MAX
        }
    }
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

/// Free space on the disk whose mount point most specifically contains `path`.
pub fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

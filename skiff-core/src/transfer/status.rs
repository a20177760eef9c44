//! Immutable status records published by transfers.

use std::path::PathBuf;

use serde::Serialize;

use super::state::TransferState;
use crate::engine::FileEntry;

/// Point-in-time view of a transfer.
///
/// Records are never mutated after publication; every change builds a new
/// record and swaps it in, so readers always see a consistent set of fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    pub display_name: String,
    pub state: TransferState,
    /// Completion percentage, 0 to 100.
    pub progress: u8,
    /// Declared size in bytes, 0 when unknown.
    pub total_size: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub complete: bool,
    pub connected_peers: u32,
    pub total_peers: u32,
    pub connected_seeds: u32,
    pub total_seeds: u32,
    pub save_path: Option<PathBuf>,
}

impl TransferStatus {
    pub fn new(display_name: impl Into<String>, state: TransferState, total_size: u64) -> Self {
        Self {
            display_name: display_name.into(),
            state,
            progress: 0,
            total_size,
            bytes_received: 0,
            bytes_sent: 0,
            download_rate: 0,
            upload_rate: 0,
            complete: false,
            connected_peers: 0,
            total_peers: 0,
            connected_seeds: 0,
            total_seeds: 0,
            save_path: None,
        }
    }

    /// Copy of this record in a different state.
    pub fn with_state(&self, state: TransferState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Seconds until completion at the current download rate.
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.complete || self.download_rate == 0 || self.total_size == 0 {
            return None;
        }
        let remaining = self.total_size.saturating_sub(self.bytes_received);
        Some(remaining.div_ceil(self.download_rate))
    }
}

/// One downloadable file inside a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferItem {
    pub path: PathBuf,
    pub size: u64,
    pub bytes_completed: u64,
    pub complete: bool,
}

impl TransferItem {
    /// Completion percentage, 0 to 100.
    pub fn progress(&self) -> u8 {
        if self.complete || self.size == 0 {
            return if self.complete { 100 } else { 0 };
        }
        ((self.bytes_completed.min(self.size) * 100) / self.size) as u8
    }
}

impl From<&FileEntry> for TransferItem {
    fn from(file: &FileEntry) -> Self {
        Self {
            path: file.path.clone(),
            size: file.size,
            bytes_completed: file.bytes_completed,
            complete: file.is_complete(),
        }
    }
}

/// Formats a rate for display, e.g. "1.5 MB/s".
pub fn format_bytes_per_second(bytes_per_second: u64) -> String {
    if bytes_per_second == 0 {
        return "0 B/s".to_string();
    }

    const UNITS: &[&str] = &["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_second as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if value >= 10.0 {
        format!("{:.0} {}", value, UNITS[unit_index])
    } else {
        format!("{:.1} {}", value, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_per_second() {
        assert_eq!(format_bytes_per_second(0), "0 B/s");
        assert_eq!(format_bytes_per_second(512), "512 B/s");
        assert_eq!(format_bytes_per_second(1536), "1.5 KB/s");
        assert_eq!(format_bytes_per_second(20 * 1024 * 1024), "20 MB/s");
    }

    #[test]
    fn test_eta() {
        let mut status = TransferStatus::new("file", TransferState::Downloading, 1000);
        assert_eq!(status.eta_seconds(), None);

        status.bytes_received = 400;
        status.download_rate = 100;
        assert_eq!(status.eta_seconds(), Some(6));

        status.complete = true;
        assert_eq!(status.eta_seconds(), None);
    }

    #[test]
    fn test_with_state_keeps_counters() {
        let mut status = TransferStatus::new("file", TransferState::Downloading, 10);
        status.bytes_received = 7;
        let paused = status.with_state(TransferState::Paused);
        assert_eq!(paused.state, TransferState::Paused);
        assert_eq!(paused.bytes_received, 7);
    }

    #[test]
    fn test_item_from_file_entry() {
        let entry = FileEntry {
            path: PathBuf::from("disc1/track01.flac"),
            size: 200,
            bytes_completed: 50,
            skipped: false,
        };
        let item = TransferItem::from(&entry);
        assert_eq!(item.progress(), 25);
        assert!(!item.complete);
    }
}

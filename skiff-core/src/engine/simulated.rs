//! In-process torrent engine for tests and the CLI.
//!
//! Parses real bencoded descriptors, keeps one [`HandleStatus`] per torrent
//! and reports every change through an [`EngineEventSink`] the way a native
//! engine would from its alert thread. Download progress only moves when a
//! caller advances it, which keeps tests deterministic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};

use super::{
    DescriptorFile, DescriptorInfo, EngineError, EngineEventSink, EngineLimit,
    EngineTorrentState, FileEntry, HandleStatus, PieceSummary, TorrentEngine, TrackerInfo,
};
use crate::transfer::InfoHash;
use crate::transfer::source::MagnetLink;

const SIMULATED_PIECE_LENGTH: u64 = 16 * 1024;

/// Errors from reading a bencoded torrent descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Bencode parsing error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Missing 'info' dictionary in torrent file")]
    MissingInfoDict,

    #[error("Missing or invalid field '{field}'")]
    InvalidField { field: &'static str },
}

impl From<DescriptorError> for EngineError {
    fn from(error: DescriptorError) -> Self {
        EngineError::InvalidDescriptor {
            reason: error.to_string(),
        }
    }
}

/// Reads name, size, files and info-hash out of descriptor bytes.
///
/// The info-hash is the SHA-1 of the re-encoded `info` dictionary.
///
/// # Errors
/// - `DescriptorError::Bencode` - Bytes are not valid bencode
/// - `DescriptorError::MissingInfoDict` - No `info` dictionary
/// - `DescriptorError::InvalidField` - Name or lengths missing or malformed
pub fn parse_descriptor(descriptor: &[u8]) -> Result<DescriptorInfo, DescriptorError> {
    let root: Value = serde_bencode::from_bytes(descriptor)?;
    let info = match root {
        Value::Dict(mut dict) => dict
            .remove(b"info".as_slice())
            .ok_or(DescriptorError::MissingInfoDict)?,
        _ => return Err(DescriptorError::MissingInfoDict),
    };

    let info_bencode = serde_bencode::to_bytes(&info)?;
    let digest = Sha1::digest(&info_bencode);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    let info_hash = InfoHash::new(hash);

    let Value::Dict(info) = info else {
        return Err(DescriptorError::MissingInfoDict);
    };

    let name = match info.get(b"name".as_slice()) {
        Some(Value::Bytes(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
        _ => return Err(DescriptorError::InvalidField { field: "name" }),
    };

    let files = match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
        (Some(Value::Int(length)), _) => vec![DescriptorFile {
            path: PathBuf::from(&name),
            size: non_negative(*length, "length")?,
        }],
        (_, Some(Value::List(entries))) => entries
            .iter()
            .map(|entry| parse_file_entry(&name, entry))
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(DescriptorError::InvalidField { field: "length" }),
    };

    Ok(DescriptorInfo {
        info_hash,
        total_size: files.iter().map(|file| file.size).sum(),
        name,
        files,
    })
}

fn parse_file_entry(root: &str, entry: &Value) -> Result<DescriptorFile, DescriptorError> {
    let Value::Dict(entry) = entry else {
        return Err(DescriptorError::InvalidField { field: "files" });
    };
    let size = match entry.get(b"length".as_slice()) {
        Some(Value::Int(length)) => non_negative(*length, "length")?,
        _ => return Err(DescriptorError::InvalidField { field: "length" }),
    };
    let Some(Value::List(components)) = entry.get(b"path".as_slice()) else {
        return Err(DescriptorError::InvalidField { field: "path" });
    };

    let mut path = PathBuf::from(root);
    for component in components {
        match component {
            Value::Bytes(bytes) => path.push(String::from_utf8_lossy(bytes).as_ref()),
            _ => return Err(DescriptorError::InvalidField { field: "path" }),
        }
    }
    Ok(DescriptorFile { path, size })
}

fn non_negative(value: i64, field: &'static str) -> Result<u64, DescriptorError> {
    u64::try_from(value).map_err(|_| DescriptorError::InvalidField { field })
}

/// Builds a minimal bencoded descriptor.
///
/// A single entry produces a single-file torrent named after it; several
/// entries produce a directory torrent named `name`.
pub fn build_descriptor(name: &str, files: &[(&str, u64)]) -> Bytes {
    let bytes_value = |text: &str| Value::Bytes(text.as_bytes().to_vec());
    let total: u64 = files.iter().map(|(_, size)| size).sum();
    let piece_count = total.div_ceil(SIMULATED_PIECE_LENGTH).max(1) as usize;

    let mut info = HashMap::new();
    info.insert(b"name".to_vec(), bytes_value(name));
    info.insert(
        b"piece length".to_vec(),
        Value::Int(SIMULATED_PIECE_LENGTH as i64),
    );
    info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; piece_count * 20]));

    if let [(_, size)] = files {
        info.insert(b"length".to_vec(), Value::Int(*size as i64));
    } else {
        let entries = files
            .iter()
            .map(|(path, size)| {
                let mut entry = HashMap::new();
                entry.insert(b"length".to_vec(), Value::Int(*size as i64));
                entry.insert(
                    b"path".to_vec(),
                    Value::List(path.split('/').map(bytes_value).collect()),
                );
                Value::Dict(entry)
            })
            .collect();
        info.insert(b"files".to_vec(), Value::List(entries));
    }

    let mut root = HashMap::new();
    root.insert(
        b"announce".to_vec(),
        bytes_value("udp://tracker.skiff.invalid:6969/announce"),
    );
    root.insert(b"info".to_vec(), Value::Dict(info));

    // Encoding an in-memory Value cannot fail.
    Bytes::from(serde_bencode::to_bytes(&Value::Dict(root)).unwrap_or_default())
}

/// A torrent the simulated swarm can serve metadata for.
#[derive(Debug, Clone)]
pub struct SimulatedTorrent {
    pub descriptor: Bytes,
    pub info: DescriptorInfo,
}

impl SimulatedTorrent {
    pub fn new(name: &str, files: &[(&str, u64)]) -> Self {
        let descriptor = build_descriptor(name, files);
        let info = parse_descriptor(&descriptor).unwrap_or_else(|_| DescriptorInfo {
            info_hash: InfoHash::new([0u8; 20]),
            name: name.to_string(),
            total_size: 0,
            files: Vec::new(),
        });
        Self { descriptor, info }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash
    }

    pub fn magnet_uri(&self) -> String {
        format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            self.info.info_hash,
            urlencoding::encode(&self.info.name)
        )
    }
}

/// Engine command observed by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedCommand {
    Start(InfoHash),
    Pause(InfoHash),
    Resume(InfoHash),
    Remove {
        info_hash: InfoHash,
        delete_data: bool,
    },
    SetLimit(EngineLimit, u64),
    Reannounce(InfoHash),
    FetchMagnet(InfoHash),
}

/// Deterministic [`TorrentEngine`] driven by explicit progress calls.
#[derive(Debug)]
pub struct SimulatedEngine {
    sink: EngineEventSink,
    handles: Mutex<HashMap<InfoHash, HandleStatus>>,
    swarm: Mutex<HashMap<InfoHash, Bytes>>,
    limits: Mutex<HashMap<EngineLimit, u64>>,
    commands: Mutex<Vec<SimulatedCommand>>,
    magnet_delay: Mutex<Duration>,
    available: AtomicBool,
}

impl SimulatedEngine {
    pub fn new(sink: EngineEventSink) -> Self {
        Self {
            sink,
            handles: Mutex::new(HashMap::new()),
            swarm: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            magnet_delay: Mutex::new(Duration::from_millis(10)),
            available: AtomicBool::new(true),
        }
    }

    /// Makes a torrent's metadata resolvable through `fetch_magnet`.
    pub fn seed_swarm(&self, torrent: &SimulatedTorrent) {
        self.swarm
            .lock()
            .insert(torrent.info_hash(), torrent.descriptor.clone());
    }

    /// Simulates the engine going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Time `fetch_magnet` takes to find metadata.
    pub fn set_magnet_delay(&self, delay: Duration) {
        *self.magnet_delay.lock() = delay;
    }

    /// Replays a handle as if restored from a previous session.
    pub fn restore(&self, status: HandleStatus) {
        self.handles.lock().insert(status.info_hash, status.clone());
        self.sink.added(status);
    }

    /// Downloads `bytes` more of a torrent and reports the new status.
    ///
    /// Completing the wanted bytes moves the handle straight to seeding.
    pub fn advance(&self, info_hash: InfoHash, bytes: u64) {
        let status = {
            let mut handles = self.handles.lock();
            let Some(status) = handles.get_mut(&info_hash) else {
                return;
            };
            if status.state == EngineTorrentState::Paused {
                return;
            }

            let wanted = status.wanted_size();
            status.bytes_received = (status.bytes_received + bytes).min(wanted);
            status.download_rate = bytes;
            status.state = EngineTorrentState::Downloading;
            fill_files(status);

            if status.bytes_received >= wanted {
                status.complete = true;
                status.download_rate = 0;
                status.state = EngineTorrentState::Seeding;
            }
            status.pieces.have = pieces_for(status.bytes_received, status.pieces.piece_size)
                .min(status.pieces.total);
            status.clone()
        };
        self.sink.updated(status);
    }

    /// Advances every active download by `bytes`.
    pub fn advance_all(&self, bytes: u64) {
        let active: Vec<InfoHash> = self
            .handles
            .lock()
            .values()
            .filter(|status| !status.complete && status.state != EngineTorrentState::Paused)
            .map(|status| status.info_hash)
            .collect();
        for info_hash in active {
            self.advance(info_hash, bytes);
        }
    }

    /// Uploads `bytes` to peers and reports the new status.
    pub fn upload(&self, info_hash: InfoHash, bytes: u64) {
        let status = {
            let mut handles = self.handles.lock();
            let Some(status) = handles.get_mut(&info_hash) else {
                return;
            };
            status.bytes_sent += bytes;
            status.upload_rate = bytes;
            status.clone()
        };
        self.sink.updated(status);
    }

    /// Re-sends the current status of a handle unchanged.
    pub fn report(&self, info_hash: InfoHash) {
        let status = self.handles.lock().get(&info_hash).cloned();
        if let Some(status) = status {
            self.sink.updated(status);
        }
    }

    pub fn handle(&self, info_hash: InfoHash) -> Option<HandleStatus> {
        self.handles.lock().get(&info_hash).cloned()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn limit(&self, limit: EngineLimit) -> Option<u64> {
        self.limits.lock().get(&limit).copied()
    }

    pub fn commands(&self) -> Vec<SimulatedCommand> {
        self.commands.lock().clone()
    }

    fn record(&self, command: SimulatedCommand) {
        self.commands.lock().push(command);
    }

    fn ensure_available(&self) -> Result<(), EngineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unavailable)
        }
    }

    fn update_handle<F>(&self, info_hash: InfoHash, change: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut HandleStatus),
    {
        let status = {
            let mut handles = self.handles.lock();
            let status = handles
                .get_mut(&info_hash)
                .ok_or(EngineError::UnknownHandle { info_hash })?;
            change(status);
            status.clone()
        };
        self.sink.updated(status);
        Ok(())
    }
}

fn pieces_for(bytes: u64, piece_size: u32) -> u32 {
    if piece_size == 0 {
        return 0;
    }
    (bytes / u64::from(piece_size)) as u32
}

fn fill_files(status: &mut HandleStatus) {
    let mut remaining = status.bytes_received;
    for file in status.files.iter_mut().filter(|file| !file.skipped) {
        file.bytes_completed = remaining.min(file.size);
        remaining -= file.bytes_completed;
    }
}

#[async_trait]
impl TorrentEngine for SimulatedEngine {
    async fn start_from_descriptor(
        &self,
        descriptor: Bytes,
        selection: Option<Vec<bool>>,
    ) -> Result<InfoHash, EngineError> {
        self.ensure_available()?;
        let info = parse_descriptor(&descriptor)?;
        let info_hash = info.info_hash;
        self.record(SimulatedCommand::Start(info_hash));

        if self.handles.lock().contains_key(&info_hash) {
            self.report(info_hash);
            return Ok(info_hash);
        }

        let mut status = HandleStatus::new(info_hash, info.name.clone(), info.total_size);
        status.state = EngineTorrentState::Downloading;
        status.files = info
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| FileEntry {
                path: file.path.clone(),
                size: file.size,
                bytes_completed: 0,
                skipped: selection
                    .as_ref()
                    .is_some_and(|selection| !selection.get(index).copied().unwrap_or(true)),
            })
            .collect();
        status.partial = status.files.iter().any(|file| file.skipped);
        status.pieces = PieceSummary {
            total: info.total_size.div_ceil(SIMULATED_PIECE_LENGTH) as u32,
            have: 0,
            piece_size: SIMULATED_PIECE_LENGTH as u32,
        };
        status.trackers = vec![TrackerInfo {
            url: "udp://tracker.skiff.invalid:6969/announce".to_string(),
            tier: 0,
            working: true,
            message: None,
        }];
        status.connected_peers = 4;
        status.total_peers = 12;
        status.connected_seeds = 2;
        status.total_seeds = 5;

        self.handles.lock().insert(info_hash, status.clone());
        self.sink.added(status);
        Ok(info_hash)
    }

    fn inspect_descriptor(&self, descriptor: &[u8]) -> Result<DescriptorInfo, EngineError> {
        Ok(parse_descriptor(descriptor)?)
    }

    async fn pause(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.ensure_available()?;
        self.record(SimulatedCommand::Pause(info_hash));
        self.update_handle(info_hash, |status| {
            status.state = EngineTorrentState::Paused;
            status.paused_by_user = true;
            status.download_rate = 0;
            status.upload_rate = 0;
        })
    }

    async fn resume(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.ensure_available()?;
        self.record(SimulatedCommand::Resume(info_hash));
        self.update_handle(info_hash, |status| {
            status.state = if status.complete {
                EngineTorrentState::Seeding
            } else {
                EngineTorrentState::Downloading
            };
            status.paused_by_user = false;
        })
    }

    async fn remove(&self, info_hash: InfoHash, delete_data: bool) -> Result<(), EngineError> {
        self.ensure_available()?;
        self.record(SimulatedCommand::Remove {
            info_hash,
            delete_data,
        });
        if self.handles.lock().remove(&info_hash).is_none() {
            return Err(EngineError::UnknownHandle { info_hash });
        }
        self.sink.removed(info_hash);
        Ok(())
    }

    async fn set_limit(&self, limit: EngineLimit, value: u64) -> Result<(), EngineError> {
        self.ensure_available()?;
        self.record(SimulatedCommand::SetLimit(limit, value));
        self.limits.lock().insert(limit, value);
        Ok(())
    }

    async fn force_reannounce(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.ensure_available()?;
        if !self.handles.lock().contains_key(&info_hash) {
            return Err(EngineError::UnknownHandle { info_hash });
        }
        self.record(SimulatedCommand::Reannounce(info_hash));
        Ok(())
    }

    async fn fetch_magnet(
        &self,
        magnet_uri: &str,
        timeout: Duration,
    ) -> Result<Bytes, EngineError> {
        self.ensure_available()?;
        let magnet = MagnetLink::parse(magnet_uri).ok_or_else(|| EngineError::CommandFailed {
            reason: format!("Not a magnet link: {magnet_uri}"),
        })?;
        self.record(SimulatedCommand::FetchMagnet(magnet.info_hash));

        let delay = *self.magnet_delay.lock();
        let descriptor = self.swarm.lock().get(&magnet.info_hash).cloned();
        match descriptor {
            Some(descriptor) if delay <= timeout => {
                tokio::time::sleep(delay).await;
                Ok(descriptor)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(EngineError::MagnetTimeout { timeout })
            }
        }
    }

    fn download_rate(&self) -> u64 {
        self.handles
            .lock()
            .values()
            .map(|status| status.download_rate)
            .sum()
    }

    fn upload_rate(&self) -> u64 {
        self.handles
            .lock()
            .values()
            .map(|status| status.upload_rate)
            .sum()
    }
}

//! Types module - data structures for Seedkeep
//!
//! These types define the data model shared by the registry, the engine
//! adapter, the persistence layer and the background tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::utils::calculate_progress;

/// Length in bytes of a content identifier (SHA-1 digest)
pub const CONTENT_ID_LEN: usize = 20;

/// Content-addressed identity of a transfer.
///
/// Derived from the canonical encoding of the descriptor's info dictionary.
/// Renders as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; CONTENT_ID_LEN]);

impl ContentId {
    pub fn from_bytes(bytes: [u8; CONTENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; CONTENT_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidInput(format!(
                "content id must be {} bytes, got {}",
                CONTENT_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ContentId {
    type Err = Error;

    /// Accepts the 40-character hex form or the 32-character base32 form
    /// used by older magnet links.
    fn from_str(s: &str) -> Result<Self> {
        let bytes = match s.len() {
            40 => hex::decode(s)
                .map_err(|e| Error::InvalidInput(format!("invalid hex content id: {}", e)))?,
            32 => data_encoding::BASE32
                .decode(s.to_ascii_uppercase().as_bytes())
                .map_err(|e| Error::InvalidInput(format!("invalid base32 content id: {}", e)))?,
            n => {
                return Err(Error::InvalidInput(format!(
                    "invalid content id length: {}",
                    n
                )))
            }
        };
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Single file in a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path segments relative to the transfer root
    pub path: Vec<String>,
    pub length: u64,
}

impl FileEntry {
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }
}

/// Normalized, immutable view of a torrent file or magnet link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub name: String,
    pub content_id: ContentId,
    pub total_length: u64,
    pub piece_length: u64,
    pub trackers: Vec<String>,
    pub files: Vec<FileEntry>,
}

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    #[default]
    Stopped,
    Downloading,
    Seeding,
    Error,
}

impl TransferStatus {
    /// Downloading or seeding
    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Downloading | TransferStatus::Seeding)
    }
}

impl From<&str> for TransferStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "downloading" => TransferStatus::Downloading,
            "seeding" => TransferStatus::Seeding,
            "error" => TransferStatus::Error,
            _ => TransferStatus::Stopped,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Stopped => write!(f, "stopped"),
            TransferStatus::Downloading => write!(f, "downloading"),
            TransferStatus::Seeding => write!(f, "seeding"),
            TransferStatus::Error => write!(f, "error"),
        }
    }
}

/// Live state of a registered transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: ContentId,
    pub descriptor: TransferDescriptor,
    pub status: TransferStatus,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub active_peers: u32,
    pub added_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl Transfer {
    /// A freshly registered, stopped transfer
    pub fn new(descriptor: TransferDescriptor) -> Self {
        Self {
            id: descriptor.content_id,
            descriptor,
            status: TransferStatus::Stopped,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            download_rate: 0,
            upload_rate: 0,
            active_peers: 0,
            added_at: Utc::now(),
            error_message: None,
        }
    }

    /// Completion in percent, recomputed from the byte counters
    pub fn progress_percent(&self) -> f64 {
        calculate_progress(self.bytes_downloaded, self.descriptor.total_length) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.descriptor.total_length > 0 && self.bytes_downloaded >= self.descriptor.total_length
    }
}

/// Persisted projection of a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: ContentId,
    pub name: String,
    pub status: TransferStatus,
    pub total_length: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub download_path: String,
    pub added_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Original metainfo, never interpreted by the persistence layer
    pub descriptor_blob: Vec<u8>,
}

impl TransferRecord {
    pub fn from_transfer(transfer: &Transfer, download_path: &str, descriptor_blob: Vec<u8>) -> Self {
        Self {
            id: transfer.id,
            name: transfer.descriptor.name.clone(),
            status: transfer.status,
            total_length: transfer.descriptor.total_length,
            bytes_downloaded: transfer.bytes_downloaded,
            bytes_uploaded: transfer.bytes_uploaded,
            download_path: download_path.to_string(),
            added_at: transfer.added_at,
            completed_at: None,
            error_message: transfer.error_message.clone(),
            descriptor_blob,
        }
    }
}

/// Per-file download priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilePriority {
    Skip,
    #[default]
    Normal,
    High,
}

/// VPN kill switch policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkPolicy {
    pub enabled: bool,
    pub interface_name: String,
    pub kill_switch_enabled: bool,
}

/// Snapshot of one local network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceObservation {
    pub name: String,
    pub is_vpn: bool,
    pub is_up: bool,
    pub addresses: Vec<std::net::IpAddr>,
}

/// Which registry implementation backs the engine adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStrategy {
    #[default]
    Locked,
    LockFree,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub download_path: String,
    pub delete_files_on_remove: bool,
    pub magnet_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub policy_check_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub list_batch_threshold: usize,
    pub registry_strategy: RegistryStrategy,
    pub network_policy: NetworkPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        let download_path = dirs::download_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join("Downloads"))
            .to_string_lossy()
            .to_string();

        Self {
            download_path,
            delete_files_on_remove: false,
            magnet_timeout_secs: 30,
            reconcile_interval_secs: 5,
            policy_check_interval_secs: 5,
            snapshot_interval_secs: 1,
            list_batch_threshold: 5,
            registry_strategy: RegistryStrategy::Locked,
            network_policy: NetworkPolicy::default(),
        }
    }
}

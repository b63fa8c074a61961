//! Protocol engine seam
//!
//! The BitTorrent engine itself lives outside this crate. Callers inject an
//! implementation of [`ProtocolEngine`]; the adapter only ever talks to it
//! through this trait, which keeps the engine mockable in tests.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::types::{ContentId, FilePriority};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Read-only view of one engine-native transfer handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHandle {
    pub content_id: ContentId,
    pub name: String,
    pub total_length: u64,
    pub bytes_completed: u64,
    pub bytes_uploaded: u64,
    pub active_peers: u32,
    pub download_rate: u64,
    pub upload_rate: u64,
}

impl EngineHandle {
    pub fn is_complete(&self) -> bool {
        self.total_length > 0 && self.bytes_completed >= self.total_length
    }
}

/// Capabilities the adapter needs from the protocol engine
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Register raw metainfo; the engine starts downloading immediately
    async fn add_torrent(&self, metainfo: &[u8], save_dir: &Path) -> EngineResult<ContentId>;

    /// Register a magnet link; metadata arrives later
    async fn add_magnet(&self, uri: &str, save_dir: &Path) -> EngineResult<ContentId>;

    /// Resolves with the full metainfo once the engine has fetched it.
    /// May never resolve; callers bound the wait.
    async fn metadata(&self, id: &ContentId) -> EngineResult<Vec<u8>>;

    /// Every handle the engine currently knows, collected in one call
    fn handles(&self) -> EngineResult<Vec<EngineHandle>>;

    fn handle(&self, id: &ContentId) -> EngineResult<Option<EngineHandle>>;

    async fn download_all(&self, id: &ContentId) -> EngineResult<()>;

    async fn stop(&self, id: &ContentId) -> EngineResult<()>;

    async fn remove(&self, id: &ContentId, delete_files: bool) -> EngineResult<()>;

    async fn set_file_priority(
        &self,
        id: &ContentId,
        file_index: usize,
        priority: FilePriority,
    ) -> EngineResult<()>;
}

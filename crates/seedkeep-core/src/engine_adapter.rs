//! Engine Adapter
//!
//! This module adapts the external protocol engine and the transfer registry
//! into the single [`Manager`] surface the transport layer talks to.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::TransfersDb;
use crate::descriptor;
use crate::engine::{EngineError, EngineHandle, ProtocolEngine};
use crate::error::{Error, Result};
use crate::registry::TransferRegistry;
use crate::service::ServiceContext;
use crate::types::{ContentId, FilePriority, Transfer, TransferRecord, TransferStatus};

/// The only surface transports may call
#[async_trait]
pub trait Manager: Send + Sync {
    async fn add_torrent(&self, data: &[u8]) -> Result<ContentId>;
    async fn add_magnet(&self, uri: &str) -> Result<ContentId>;
    async fn remove_torrent(&self, id: &ContentId) -> Result<()>;
    fn get_torrent(&self, id: &ContentId) -> Result<Transfer>;
    fn list_torrents(&self) -> Vec<Transfer>;
    async fn start_torrent(&self, id: &ContentId) -> Result<()>;
    async fn stop_torrent(&self, id: &ContentId) -> Result<()>;
    fn count(&self) -> usize;
}

/// Outcome of startup recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
}

/// Engine lookup result for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandleLookup {
    Found(EngineHandle),
    Missing,
    Failed,
}

/// One transfer as seen by the reconciler
#[derive(Debug, Clone)]
pub(crate) struct ProgressSample {
    /// Status held by the registry before derivation
    pub tracked: TransferStatus,
    /// Transfer with live counters and derived status
    pub transfer: Transfer,
    pub lookup: HandleLookup,
}

/// Serializes operations on the same content id
#[derive(Default)]
struct IdLocks {
    locks: DashMap<ContentId, Arc<Mutex<()>>>,
}

struct IdGuard<'a> {
    owner: &'a IdLocks,
    id: ContentId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl IdLocks {
    async fn lock(&self, id: &ContentId) -> IdGuard<'_> {
        let mutex = self.locks.entry(*id).or_default().clone();
        IdGuard {
            owner: self,
            id: *id,
            guard: Some(mutex.lock_owned().await),
        }
    }
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still references the mutex: nobody holds or waits on it.
        self.owner
            .locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Adapter between the registry, the protocol engine and persistence
#[derive(Clone)]
pub struct TorrentManager {
    engine: Arc<dyn ProtocolEngine>,
    registry: Arc<dyn TransferRegistry>,
    ctx: Arc<ServiceContext>,
    locks: Arc<IdLocks>,
    magnet_timeout: Duration,
    batch_threshold: usize,
}

impl TorrentManager {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        registry: Arc<dyn TransferRegistry>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        let magnet_timeout = Duration::from_secs(ctx.settings.magnet_timeout_secs);
        let batch_threshold = ctx.settings.list_batch_threshold;
        Self {
            engine,
            registry,
            ctx,
            locks: Arc::new(IdLocks::default()),
            magnet_timeout,
            batch_threshold,
        }
    }

    /// Override the metadata wait bound for magnet links
    pub fn with_magnet_timeout(mut self, timeout: Duration) -> Self {
        self.magnet_timeout = timeout;
        self
    }

    /// Override how many transfers a listing needs before it is batched
    pub fn with_batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_threshold = threshold;
        self
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    fn download_dir(&self) -> &Path {
        Path::new(&self.ctx.settings.download_path)
    }

    /// Resolve a specific set of ids; unknown ids are left out
    pub fn list_many(&self, ids: &[ContentId]) -> Vec<Transfer> {
        let transfers: Vec<Transfer> = ids.iter().filter_map(|id| self.registry.get(id)).collect();
        self.resolve(transfers)
    }

    /// Change the download priority of one file
    pub async fn set_file_priority(
        &self,
        id: &ContentId,
        file_index: usize,
        priority: FilePriority,
    ) -> Result<()> {
        let transfer = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        if file_index >= transfer.descriptor.files.len() {
            return Err(Error::InvalidInput(format!(
                "file index {} out of range ({} files)",
                file_index,
                transfer.descriptor.files.len()
            )));
        }
        self.engine.set_file_priority(id, file_index, priority).await?;
        Ok(())
    }

    /// Re-submit every persisted transfer to the engine.
    ///
    /// Each record stands alone: a record that cannot be decoded or that the
    /// engine rejects is logged and skipped.
    pub async fn restore_transfers(&self) -> RestoreReport {
        let mut report = RestoreReport::default();

        let scan = match TransfersDb::scan_for_recovery(&self.ctx.db) {
            Ok(scan) => scan,
            Err(e) => {
                log::error!("Failed to read persisted transfers: {}", e);
                return report;
            }
        };
        report.skipped += scan.unreadable;

        if scan.records.is_empty() {
            return report;
        }

        log::info!("Restoring {} persisted transfers", scan.records.len());
        let allowed = self.ctx.gate.is_allowed();

        for record in scan.records {
            match self.restore_one(&record, allowed).await {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    log::warn!(
                        "Skipping persisted transfer {} ({}): {}",
                        record.name,
                        record.id,
                        e
                    );
                    report.skipped += 1;
                }
            }
        }

        log::info!(
            "Restored {} transfers, skipped {}",
            report.restored,
            report.skipped
        );
        report
    }

    async fn restore_one(&self, record: &TransferRecord, allowed: bool) -> Result<()> {
        let descriptor = descriptor::parse(&record.descriptor_blob)?;
        if descriptor.content_id != record.id {
            return Err(Error::InvalidInput(format!(
                "descriptor hashes to {}, record says {}",
                descriptor.content_id, record.id
            )));
        }

        let id = record.id;
        let _guard = self.locks.lock(&id).await;
        if self.registry.contains(&id) {
            return Ok(());
        }

        // A denied gate keeps the record away from the engine until started.
        if allowed {
            self.engine
                .add_torrent(&record.descriptor_blob, Path::new(&record.download_path))
                .await?;
        }

        self.registry.add(descriptor);
        self.registry.update(&id, &mut |t: &mut Transfer| {
            t.bytes_downloaded = record.bytes_downloaded;
            t.bytes_uploaded = record.bytes_uploaded;
            t.added_at = record.added_at;
        })?;

        if record.status.is_active() && allowed {
            self.registry.start(&id)?;
            if record.status == TransferStatus::Seeding {
                self.registry
                    .update(&id, &mut |t: &mut Transfer| t.status = TransferStatus::Seeding)?;
            }
            return Ok(());
        }

        // The engine starts on add; put it back to rest.
        if allowed {
            if let Err(e) = self.engine.stop(&id).await {
                log::warn!("Failed to stop restored transfer {}: {}", id, e);
            }
        }
        if record.status.is_active() {
            log::warn!(
                "Kill switch active, restoring {} as stopped",
                record.name
            );
        } else if record.status == TransferStatus::Error {
            let message = record.error_message.clone();
            self.registry.update(&id, &mut |t: &mut Transfer| {
                t.status = TransferStatus::Error;
                t.error_message = message.clone();
            })?;
        }
        Ok(())
    }

    /// Every registered transfer with its live engine view
    pub(crate) fn progress_snapshot(&self) -> Vec<ProgressSample> {
        let transfers = self.registry.list();
        let lookups = self.lookup_handles(&transfers);
        transfers
            .into_iter()
            .zip(lookups)
            .map(|(transfer, lookup)| {
                let tracked = transfer.status;
                let transfer = match &lookup {
                    HandleLookup::Found(handle) => merge(transfer, handle),
                    HandleLookup::Missing | HandleLookup::Failed => transfer,
                };
                ProgressSample {
                    tracked,
                    transfer,
                    lookup,
                }
            })
            .collect()
    }

    /// Store live counters and, if the registry still holds `expected`,
    /// move the transfer to `next`. Returns whether the status was applied.
    pub(crate) fn apply_transition(
        &self,
        transfer: &Transfer,
        expected: TransferStatus,
        next: TransferStatus,
        error_message: Option<&str>,
    ) -> bool {
        let mut applied = false;
        let result = self.registry.update(&transfer.id, &mut |t: &mut Transfer| {
            t.bytes_downloaded = t.bytes_downloaded.max(transfer.bytes_downloaded);
            t.bytes_uploaded = t.bytes_uploaded.max(transfer.bytes_uploaded);
            if t.status == expected {
                t.status = next;
                t.error_message = error_message.map(str::to_string);
                applied = true;
            }
        });
        if let Err(e) = result {
            log::debug!("Transfer {} vanished during reconciliation: {}", transfer.id, e);
        }
        applied
    }

    fn lookup_handles(&self, transfers: &[Transfer]) -> Vec<HandleLookup> {
        if transfers.len() > self.batch_threshold {
            match self.engine.handles() {
                Ok(handles) => {
                    let mut table: HashMap<ContentId, EngineHandle> = handles
                        .into_iter()
                        .map(|h| (h.content_id, h))
                        .collect();
                    return transfers
                        .iter()
                        .map(|t| match table.remove(&t.id) {
                            Some(handle) => HandleLookup::Found(handle),
                            None => HandleLookup::Missing,
                        })
                        .collect();
                }
                Err(e) => {
                    log::warn!(
                        "Batch handle lookup failed, falling back to per-transfer lookups: {}",
                        e
                    );
                }
            }
        }

        transfers
            .iter()
            .map(|t| match self.engine.handle(&t.id) {
                Ok(Some(handle)) => HandleLookup::Found(handle),
                Ok(None) => HandleLookup::Missing,
                Err(e) => {
                    log::debug!("Engine lookup for {} failed: {}", t.id, e);
                    HandleLookup::Failed
                }
            })
            .collect()
    }

    fn resolve(&self, transfers: Vec<Transfer>) -> Vec<Transfer> {
        let lookups = self.lookup_handles(&transfers);
        transfers
            .into_iter()
            .zip(lookups)
            .map(|(transfer, lookup)| match lookup {
                HandleLookup::Found(handle) => merge(transfer, &handle),
                HandleLookup::Missing | HandleLookup::Failed => transfer,
            })
            .collect()
    }

    /// Best-effort write of a freshly registered transfer
    fn persist_new(&self, id: &ContentId, descriptor_blob: Vec<u8>) {
        let Some(transfer) = self.registry.get(id) else {
            return;
        };
        let record =
            TransferRecord::from_transfer(&transfer, &self.ctx.settings.download_path, descriptor_blob);
        if let Err(e) = TransfersDb::save(&self.ctx.db, &record) {
            log::error!("Failed to persist transfer {}: {}", id, e);
        }
    }

    /// Best-effort write of the current registry status
    fn persist_status(&self, id: &ContentId) {
        let Some(transfer) = self.registry.get(id) else {
            return;
        };
        match TransfersDb::update_status(
            &self.ctx.db,
            id,
            transfer.status,
            transfer.error_message.as_deref(),
        ) {
            Ok(true) => {}
            Ok(false) => log::debug!("No persisted record for transfer {}", id),
            Err(e) => log::error!("Failed to persist status of {}: {}", id, e),
        }
    }

    /// Hand the persisted descriptor back to an engine that lost the transfer
    async fn resubmit(&self, id: &ContentId) -> Result<()> {
        let record = match TransfersDb::get(&self.ctx.db, id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(Error::Engine(format!(
                    "engine lost transfer {} and no descriptor is persisted",
                    id
                )))
            }
            Err(e) => {
                log::error!("Failed to load descriptor of {}: {}", id, e);
                return Err(Error::Engine(format!(
                    "engine lost transfer {} and its descriptor is unreadable",
                    id
                )));
            }
        };

        log::info!("Resubmitting {} to the engine", record.name);
        self.engine
            .add_torrent(&record.descriptor_blob, Path::new(&record.download_path))
            .await?;
        Ok(())
    }

    /// Drop a magnet registration that never became a transfer
    async fn drop_partial(&self, id: &ContentId) {
        if let Err(e) = self.engine.remove(id, false).await {
            log::warn!("Failed to drop partial registration {}: {}", id, e);
        }
    }
}

#[async_trait]
impl Manager for TorrentManager {
    async fn add_torrent(&self, data: &[u8]) -> Result<ContentId> {
        self.ctx.gate.ensure_allowed()?;

        let descriptor = descriptor::parse(data)?;
        let id = descriptor.content_id;
        let _guard = self.locks.lock(&id).await;

        if self.registry.contains(&id) {
            log::debug!("Torrent {} already registered", id);
            return Ok(id);
        }

        let engine_id = self.engine.add_torrent(data, self.download_dir()).await?;
        if engine_id != id {
            self.drop_partial(&engine_id).await;
            return Err(Error::Engine(format!(
                "engine registered {} for descriptor {}",
                engine_id, id
            )));
        }

        let name = descriptor.name.clone();
        self.registry.add(descriptor);
        self.registry.start(&id)?;
        self.persist_new(&id, data.to_vec());

        log::info!("Added torrent {} ({})", name, id);
        Ok(id)
    }

    async fn add_magnet(&self, uri: &str) -> Result<ContentId> {
        self.ctx.gate.ensure_allowed()?;

        let magnet = descriptor::parse_magnet(uri)?;
        let id = magnet.content_id;
        let _guard = self.locks.lock(&id).await;

        if self.registry.contains(&id) {
            log::debug!("Magnet {} already registered", id);
            return Ok(id);
        }

        self.engine.add_magnet(uri, self.download_dir()).await?;
        log::info!("Waiting for metadata of {} ({})", magnet.name, id);

        let metainfo = tokio::select! {
            biased;
            _ = self.ctx.shutdown.cancelled() => {
                self.drop_partial(&id).await;
                return Err(Error::Cancelled);
            }
            result = tokio::time::timeout(self.magnet_timeout, self.engine.metadata(&id)) => {
                match result {
                    Ok(Ok(metainfo)) => metainfo,
                    Ok(Err(e)) => {
                        self.drop_partial(&id).await;
                        return Err(e.into());
                    }
                    Err(_) => {
                        self.drop_partial(&id).await;
                        log::warn!("Metadata for {} not resolved in time", id);
                        return Err(Error::Timeout(format!(
                            "metadata for {} not resolved within {:?}",
                            id, self.magnet_timeout
                        )));
                    }
                }
            }
        };

        let descriptor = match descriptor::parse(&metainfo) {
            Ok(d) if d.content_id == id => d,
            Ok(d) => {
                self.drop_partial(&id).await;
                return Err(Error::InvalidInput(format!(
                    "resolved metadata hashes to {}, expected {}",
                    d.content_id, id
                )));
            }
            Err(e) => {
                self.drop_partial(&id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.engine.download_all(&id).await {
            self.drop_partial(&id).await;
            return Err(e.into());
        }

        let name = descriptor.name.clone();
        self.registry.add(descriptor);
        self.registry.start(&id)?;
        self.persist_new(&id, metainfo);

        log::info!("Added magnet {} ({})", name, id);
        Ok(id)
    }

    async fn remove_torrent(&self, id: &ContentId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        if !self.registry.contains(id) {
            return Err(Error::NotFound(format!("transfer {}", id)));
        }

        match self
            .engine
            .remove(id, self.ctx.settings.delete_files_on_remove)
            .await
        {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {
                log::debug!("Engine no longer knew transfer {}", id);
            }
            Err(e) => return Err(e.into()),
        }

        self.registry.remove(id)?;
        if let Err(e) = TransfersDb::delete(&self.ctx.db, id) {
            log::error!("Failed to delete persisted transfer {}: {}", id, e);
        }

        log::info!("Removed transfer {}", id);
        Ok(())
    }

    fn get_torrent(&self, id: &ContentId) -> Result<Transfer> {
        let transfer = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        match self.engine.handle(id) {
            Ok(Some(handle)) => Ok(merge(transfer, &handle)),
            Ok(None) => Ok(transfer),
            Err(e) => {
                log::debug!("Engine lookup for {} failed: {}", id, e);
                Ok(transfer)
            }
        }
    }

    fn list_torrents(&self) -> Vec<Transfer> {
        self.resolve(self.registry.list())
    }

    async fn start_torrent(&self, id: &ContentId) -> Result<()> {
        self.ctx.gate.ensure_allowed()?;

        let _guard = self.locks.lock(id).await;
        if !self.registry.contains(id) {
            return Err(Error::NotFound(format!("transfer {}", id)));
        }

        match self.engine.download_all(id).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => self.resubmit(id).await?,
            Err(e) => return Err(e.into()),
        }
        self.registry.start(id)?;
        self.persist_status(id);
        Ok(())
    }

    async fn stop_torrent(&self, id: &ContentId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        if !self.registry.contains(id) {
            return Err(Error::NotFound(format!("transfer {}", id)));
        }

        match self.engine.stop(id).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {
                log::debug!("Transfer {} already gone from the engine", id);
            }
            Err(e) => return Err(e.into()),
        }
        self.registry.stop(id)?;
        self.persist_status(id);
        Ok(())
    }

    fn count(&self) -> usize {
        self.registry.count()
    }
}

/// Status shown for a transfer given what the engine reports.
///
/// A transfer that finished and has no peers shows as `Stopped`, the same
/// value a user-stopped transfer shows.
pub fn derive_status(tracked: TransferStatus, complete: bool, active_peers: u32) -> TransferStatus {
    match (tracked, complete, active_peers > 0) {
        (TransferStatus::Error, _, _) => tracked,
        (_, true, true) => TransferStatus::Seeding,
        (_, false, true) => TransferStatus::Downloading,
        (_, true, false) => TransferStatus::Stopped,
        (_, false, false) => tracked,
    }
}

/// Overlay live engine counters on a registry entry
fn merge(mut transfer: Transfer, handle: &EngineHandle) -> Transfer {
    transfer.bytes_downloaded = transfer.bytes_downloaded.max(handle.bytes_completed);
    transfer.bytes_uploaded = transfer.bytes_uploaded.max(handle.bytes_uploaded);
    transfer.download_rate = handle.download_rate;
    transfer.upload_rate = handle.upload_rate;
    transfer.active_peers = handle.active_peers;
    transfer.status = derive_status(
        transfer.status,
        transfer.is_complete(),
        handle.active_peers,
    );
    transfer
}

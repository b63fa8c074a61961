//! Transfer registry - in-memory store of transfers keyed by content id
//!
//! Two interchangeable strategies implement [`TransferRegistry`]:
//! [`LockedRegistry`] guards one map with a reader-writer lock, and
//! [`LockFreeRegistry`] uses a sharded concurrent map with an atomic count.

mod locked;
mod lockfree;

pub use locked::LockedRegistry;
pub use lockfree::LockFreeRegistry;

use std::sync::Arc;

use crate::error::Result;
use crate::types::{ContentId, RegistryStrategy, Transfer, TransferDescriptor, TransferStatus};

/// At most one [`Transfer`] per content id.
pub trait TransferRegistry: Send + Sync {
    /// Register a descriptor. Returns the existing id untouched when the
    /// content id is already present.
    fn add(&self, descriptor: TransferDescriptor) -> ContentId;

    fn remove(&self, id: &ContentId) -> Result<()>;

    fn get(&self, id: &ContentId) -> Option<Transfer>;

    /// Snapshot of every transfer, in no particular order
    fn list(&self) -> Vec<Transfer>;

    fn count(&self) -> usize;

    /// Mutate one entry in place under the registry's own synchronization
    fn update(&self, id: &ContentId, f: &mut dyn FnMut(&mut Transfer)) -> Result<()>;

    fn contains(&self, id: &ContentId) -> bool {
        self.get(id).is_some()
    }

    fn start(&self, id: &ContentId) -> Result<()> {
        self.update(id, &mut apply_start)
    }

    fn stop(&self, id: &ContentId) -> Result<()> {
        self.update(id, &mut apply_stop)
    }
}

/// `Stopped` or `Error` become `Downloading`; active transfers keep their state.
pub(crate) fn apply_start(transfer: &mut Transfer) {
    match transfer.status {
        TransferStatus::Stopped | TransferStatus::Error => {
            transfer.status = TransferStatus::Downloading;
            transfer.error_message = None;
        }
        TransferStatus::Downloading | TransferStatus::Seeding => {}
    }
}

pub(crate) fn apply_stop(transfer: &mut Transfer) {
    transfer.status = TransferStatus::Stopped;
    transfer.error_message = None;
    transfer.download_rate = 0;
    transfer.upload_rate = 0;
    transfer.active_peers = 0;
}

impl RegistryStrategy {
    pub fn build(self) -> Arc<dyn TransferRegistry> {
        match self {
            RegistryStrategy::Locked => Arc::new(LockedRegistry::new()),
            RegistryStrategy::LockFree => Arc::new(LockFreeRegistry::new()),
        }
    }
}

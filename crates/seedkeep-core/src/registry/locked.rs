//! Registry guarded by a single reader-writer lock

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::TransferRegistry;
use crate::error::{Error, Result};
use crate::types::{ContentId, Transfer, TransferDescriptor};

/// Reads share the lock, every write takes it exclusively.
#[derive(Debug, Default)]
pub struct LockedRegistry {
    transfers: RwLock<HashMap<ContentId, Transfer>>,
}

impl LockedRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferRegistry for LockedRegistry {
    fn add(&self, descriptor: TransferDescriptor) -> ContentId {
        let id = descriptor.content_id;
        let mut transfers = self.transfers.write().unwrap_or_else(PoisonError::into_inner);
        if let Entry::Vacant(slot) = transfers.entry(id) {
            slot.insert(Transfer::new(descriptor));
        }
        id
    }

    fn remove(&self, id: &ContentId) -> Result<()> {
        let mut transfers = self.transfers.write().unwrap_or_else(PoisonError::into_inner);
        transfers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))
    }

    fn get(&self, id: &ContentId) -> Option<Transfer> {
        let transfers = self.transfers.read().unwrap_or_else(PoisonError::into_inner);
        transfers.get(id).cloned()
    }

    fn list(&self) -> Vec<Transfer> {
        let transfers = self.transfers.read().unwrap_or_else(PoisonError::into_inner);
        transfers.values().cloned().collect()
    }

    fn count(&self) -> usize {
        self.transfers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn update(&self, id: &ContentId, f: &mut dyn FnMut(&mut Transfer)) -> Result<()> {
        let mut transfers = self.transfers.write().unwrap_or_else(PoisonError::into_inner);
        let transfer = transfers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        f(transfer);
        Ok(())
    }

    fn contains(&self, id: &ContentId) -> bool {
        self.transfers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

//! Registry without a global lock
//!
//! Entries live in a sharded [`DashMap`]; installs and removals are atomic
//! per key and the element count is kept in a separate atomic. A `list` that
//! races with writers may miss or include the element being changed, but
//! every element it returns is a whole clone.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::TransferRegistry;
use crate::error::{Error, Result};
use crate::types::{ContentId, Transfer, TransferDescriptor};

#[derive(Debug, Default)]
pub struct LockFreeRegistry {
    transfers: DashMap<ContentId, Transfer>,
    count: AtomicUsize,
}

impl LockFreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferRegistry for LockFreeRegistry {
    fn add(&self, descriptor: TransferDescriptor) -> ContentId {
        let id = descriptor.content_id;
        if let Entry::Vacant(slot) = self.transfers.entry(id) {
            slot.insert(Transfer::new(descriptor));
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        id
    }

    fn remove(&self, id: &ContentId) -> Result<()> {
        match self.transfers.remove(id) {
            Some(_) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            }
            None => Err(Error::NotFound(format!("transfer {}", id))),
        }
    }

    fn get(&self, id: &ContentId) -> Option<Transfer> {
        self.transfers.get(id).map(|entry| entry.value().clone())
    }

    fn list(&self) -> Vec<Transfer> {
        self.transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn update(&self, id: &ContentId, f: &mut dyn FnMut(&mut Transfer)) -> Result<()> {
        let mut entry = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        f(entry.value_mut());
        Ok(())
    }

    fn contains(&self, id: &ContentId) -> bool {
        self.transfers.contains_key(id)
    }
}

//! Bounded pool of extension slots.
//!
//! A slot is a numeric suffix appended to an archive base key. Holding a slot
//! gives exclusive write access to that suffixed object, so appends to
//! different slots run in parallel while one slot serializes its own key.

use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Debug)]
pub struct ExtensionSlotPool {
    permits: Arc<Semaphore>,
    free: Arc<Mutex<VecDeque<u32>>>,
    capacity: u32,
}

impl ExtensionSlotPool {
    /// A pool of slots `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            free: Arc::new(Mutex::new((0..capacity).collect())),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Every slot id, whether free or held.
    pub fn slot_ids(&self) -> std::ops::Range<u32> {
        0..self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> StorageResult<SlotGuard> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::SlotsExhausted)?;
        self.take(permit)
    }

    /// Take a free slot without waiting.
    pub fn try_acquire(&self) -> StorageResult<SlotGuard> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| StorageError::SlotsExhausted)?;
        self.take(permit)
    }

    /// Wait until every slot is free and hold them all.
    pub async fn acquire_all(&self) -> StorageResult<Vec<SlotGuard>> {
        let mut guards = Vec::with_capacity(self.capacity as usize);
        for _ in 0..self.capacity {
            guards.push(self.acquire().await?);
        }
        guards.sort_by_key(SlotGuard::slot);
        Ok(guards)
    }

    fn take(&self, permit: OwnedSemaphorePermit) -> StorageResult<SlotGuard> {
        // A permit guarantees a queued slot.
        let slot = self
            .free
            .lock()
            .pop_front()
            .ok_or(StorageError::SlotsExhausted)?;
        Ok(SlotGuard {
            slot,
            free: self.free.clone(),
            _permit: permit,
        })
    }
}

/// A held slot, returned to the pool on drop.
#[derive(Debug)]
pub struct SlotGuard {
    slot: u32,
    free: Arc<Mutex<VecDeque<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so a waiter woken by the
        // permit always finds the slot queued.
        self.free.lock().push_back(self.slot);
    }
}

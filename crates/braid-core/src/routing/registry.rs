//! Capability Registry: worker id → static capability set + live load counter.
//!
//! 登録は起動時のみ（`&mut self`）。実行中に変化するのは load カウンタだけで、
//! これは atomic に更新されます（acquire は上限付きの CAS）。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::{CapabilityTag, WorkerId};
use crate::error::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub capabilities: BTreeSet<CapabilityTag>,
    pub max_concurrent: u32,
}

impl WorkerDescriptor {
    pub fn new<I, T>(id: impl Into<WorkerId>, capabilities: I, max_concurrent: u32) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CapabilityTag>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_concurrent,
        }
    }

    pub fn covers(&self, tags: &BTreeSet<CapabilityTag>) -> bool {
        tags.is_subset(&self.capabilities)
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub id: WorkerId,
    pub current_load: u32,
    pub max_concurrent: u32,
}

struct WorkerSlot {
    descriptor: WorkerDescriptor,
    load: AtomicU32,
}

#[derive(Default)]
pub struct CapabilityRegistry {
    workers: BTreeMap<WorkerId, WorkerSlot>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: WorkerDescriptor) -> Result<(), RegistryError> {
        if descriptor.max_concurrent == 0 {
            return Err(RegistryError::ZeroCapacity(descriptor.id));
        }
        if descriptor.capabilities.iter().all(CapabilityTag::is_empty) {
            return Err(RegistryError::NoCapabilities(descriptor.id));
        }
        if self.workers.contains_key(&descriptor.id) {
            return Err(RegistryError::DuplicateWorker(descriptor.id));
        }
        self.workers.insert(
            descriptor.id.clone(),
            WorkerSlot {
                descriptor,
                load: AtomicU32::new(0),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerDescriptor> {
        self.workers.get(id).map(|slot| &slot.descriptor)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    /// Descriptors in worker-id order.
    pub fn descriptors(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.values().map(|slot| &slot.descriptor)
    }

    pub fn load(&self, id: &WorkerId) -> Option<u32> {
        self.workers
            .get(id)
            .map(|slot| slot.load.load(Ordering::Acquire))
    }

    /// Takes one slot on `id` if it is below `max_concurrent`.
    ///
    /// Returns false when the worker is saturated or unknown.
    pub fn try_acquire(&self, id: &WorkerId) -> bool {
        let Some(slot) = self.workers.get(id) else {
            return false;
        };
        let max = slot.descriptor.max_concurrent;
        slot.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < max).then_some(load + 1)
            })
            .is_ok()
    }

    /// Frees one slot on `id`. Never underflows.
    pub fn release(&self, id: &WorkerId) {
        if let Some(slot) = self.workers.get(id) {
            let _ = slot
                .load
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                    load.checked_sub(1)
                });
        }
    }

    /// Sum of `max_concurrent` over all workers: the global parallelism budget.
    pub fn total_capacity(&self) -> u32 {
        self.workers
            .values()
            .map(|slot| slot.descriptor.max_concurrent)
            .sum()
    }

    pub fn snapshot(&self) -> Vec<WorkerLoad> {
        self.workers
            .values()
            .map(|slot| WorkerLoad {
                id: slot.descriptor.id.clone(),
                current_load: slot.load.load(Ordering::Acquire),
                max_concurrent: slot.descriptor.max_concurrent,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

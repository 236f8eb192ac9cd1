// SPDX-License-Identifier: MPL-2.0

//! Redistribution of shareable sources across CPUs.
//!
//! Best-effort by contract: the balancer only reprograms the per-source
//! target-CPU field, round-robin over the CPUs with a valid identity.
//! The hardware retarget itself happens on the next dispatch pass of the
//! source, and a refused move is logged and forgotten.

use core::sync::atomic::Ordering;

use log::debug;

use crate::{
    cpu::{CpuId, CpuSet},
    source::{SourceId, SourceSlot},
    IrqDispatcher,
};

pub(crate) struct Balancer {
    cursor: u32,
}

impl Balancer {
    pub(crate) fn new() -> Self {
        Self { cursor: 0 }
    }

    /// The next target in round-robin order, skipping CPUs without a
    /// valid identity. `None` when no CPU qualifies.
    pub(crate) fn next_target(&mut self, online: &CpuSet, nr_cpus: usize) -> Option<CpuId> {
        for _ in 0..nr_cpus {
            let candidate = CpuId::new(self.cursor % nr_cpus as u32);
            self.cursor = self.cursor.wrapping_add(1);
            if online.contains(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl IrqDispatcher {
    /// Recomputes the delivery target of every relocatable source.
    ///
    /// Meant to be called periodically; registration triggers the same
    /// per-source pass on its own.
    pub fn rebalance(&self) {
        for (id, slot) in self.registry.iter_init() {
            self.assign_target(id, slot);
        }
    }

    /// A source may be moved iff it is active, hardware-addressable, and
    /// not at the pinned level.
    pub(crate) fn assign_target(&self, source: SourceId, slot: &SourceSlot) {
        if !slot.active.load(Ordering::Acquire) {
            return;
        }
        if slot.level.load(Ordering::Relaxed) == self.config.pinned_level {
            return;
        }
        if slot.inner.lock().control.is_none() {
            return;
        }
        let Some(target) = self
            .balancer
            .lock()
            .next_target(&self.online, self.config.nr_cpus)
        else {
            return;
        };
        slot.target_cpu.store(target.raw(), Ordering::Release);
        debug!("source {} now targets cpu {}", source.raw(), target.raw());
    }
}

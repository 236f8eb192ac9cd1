// SPDX-License-Identifier: MPL-2.0

//! Read-only introspection of the source table.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::{source::SourceId, IrqDispatcher};

/// A point-in-time view of one interrupt source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSnapshot {
    /// The source's discriminant.
    pub source: SourceId,
    /// Its priority level.
    pub level: u8,
    /// Whether hardware delivery is currently enabled.
    pub active: bool,
    /// How many handlers are attached.
    pub handlers: usize,
    /// Times the source was serviced, indexed by CPU.
    pub service: Vec<u64>,
}

impl IrqDispatcher {
    /// Takes a snapshot of every initialized source.
    ///
    /// Reads atomics only — never blocks, never mutates, and may be
    /// called from any context, including while dispatch is running.
    pub fn snapshot(&self) -> Vec<SourceSnapshot> {
        self.registry
            .iter_init()
            .map(|(source, slot)| SourceSnapshot {
                source,
                level: slot.level.load(Ordering::Acquire),
                active: slot.active.load(Ordering::Acquire),
                handlers: slot.handler_count.load(Ordering::Acquire),
                service: slot
                    .service
                    .iter()
                    .map(|counter| counter.load(Ordering::Relaxed))
                    .collect(),
            })
            .collect()
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures for the unit tests.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{cpu::CpuId, source::SourceControl, DispatchConfig, IrqDispatcher};

/// A `SourceControl` that records every operation.
pub(crate) struct FakeControl {
    pub(crate) enables: AtomicUsize,
    pub(crate) disables: AtomicUsize,
    pub(crate) clears: AtomicUsize,
    pub(crate) retargets: Mutex<Vec<u32>>,
    pub(crate) refuse_retarget: AtomicBool,
}

impl FakeControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            enables: AtomicUsize::new(0),
            disables: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            retargets: Mutex::new(Vec::new()),
            refuse_retarget: AtomicBool::new(false),
        })
    }
}

impl SourceControl for FakeControl {
    fn enable(&self) {
        self.enables.fetch_add(1, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.disables.fetch_add(1, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn retarget(&self, cpu: CpuId) -> bool {
        if self.refuse_retarget.load(Ordering::SeqCst) {
            return false;
        }
        self.retargets.lock().push(cpu.raw());
        true
    }
}

/// A dispatcher with the default quirk parameters and the given sizing.
pub(crate) fn dispatcher(nr_cpus: usize, nr_sources: usize) -> IrqDispatcher {
    IrqDispatcher::new(DispatchConfig {
        nr_cpus,
        nr_sources,
        ..Default::default()
    })
}

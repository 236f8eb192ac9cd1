// SPDX-License-Identifier: MPL-2.0

//! Interrupt-source descriptors.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{cpu::CpuId, handler::HandlerContainer};

/// Identifies one interrupt source.
///
/// The id doubles as the discriminant of the physical wire and as the
/// index into the dispatcher's source table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) u32);

impl SourceId {
    /// Returns the raw discriminant value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Control-register access for one hardware-addressable interrupt source.
///
/// Implemented by the interrupt-controller driver; the core never touches
/// chip registers itself. Sources multiplexed behind one physical control
/// register must share a single `Arc<dyn SourceControl>` — the core uses
/// pointer identity to recognize such siblings and keeps the register
/// enabled while any of them is still active.
pub trait SourceControl: Send + Sync {
    /// Unmasks hardware delivery (the mask/enable register).
    fn enable(&self);

    /// Masks hardware delivery.
    fn disable(&self);

    /// Acknowledges the current assertion and re-arms the source
    /// (the clear/acknowledge register).
    fn clear(&self);

    /// Redirects future deliveries to `cpu`. Returns `false` if the
    /// hardware refused the move; the caller treats that as best-effort.
    fn retarget(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        false
    }
}

/// Per-source dispatch states. Idle -> Queued on delivery, Queued ->
/// Dispatching when popped, back to Idle when the pass is done with it.
pub(crate) mod state {
    pub(crate) const IDLE: u8 = 0;
    pub(crate) const QUEUED: u8 = 1;
    pub(crate) const DISPATCHING: u8 = 2;
}

/// Sentinel for an unlinked `next_pending` field.
pub(crate) const NO_LINK: u32 = u32::MAX;
/// Sentinel for a source the balancer has not assigned yet.
pub(crate) const NO_TARGET: u32 = u32::MAX;

/// The lock-protected part of a source.
pub(crate) struct SourceInner {
    pub(crate) control: Option<Arc<dyn SourceControl>>,
    pub(crate) handlers: HandlerContainer,
    /// Never reset, even when the slot is re-created, so tokens from a
    /// previous incarnation of the slot stay stale.
    pub(crate) next_record: u64,
}

/// One slot of the source table.
///
/// Slots exist for the lifetime of the dispatcher; `init` marks whether
/// `create_source` has populated this one. The hot fields read by the
/// delivery and dispatch paths are atomics; everything touched only from
/// process context sits behind the `inner` lock.
pub(crate) struct SourceSlot {
    pub(crate) init: AtomicBool,
    pub(crate) level: AtomicU8,
    pub(crate) active: AtomicBool,
    pub(crate) pending: AtomicBool,
    pub(crate) dispatch_state: AtomicU8,
    pub(crate) next_pending: AtomicU32,
    pub(crate) target_cpu: AtomicU32,
    pub(crate) handler_count: AtomicUsize,
    pub(crate) service: Box<[AtomicU64]>,
    pub(crate) inner: Mutex<SourceInner>,
}

impl SourceSlot {
    pub(crate) fn new(nr_cpus: usize) -> Self {
        let service: Vec<AtomicU64> = (0..nr_cpus).map(|_| AtomicU64::new(0)).collect();
        Self {
            init: AtomicBool::new(false),
            level: AtomicU8::new(0),
            active: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            dispatch_state: AtomicU8::new(state::IDLE),
            next_pending: AtomicU32::new(NO_LINK),
            target_cpu: AtomicU32::new(NO_TARGET),
            handler_count: AtomicUsize::new(0),
            service: service.into_boxed_slice(),
            inner: Mutex::new(SourceInner {
                control: None,
                handlers: HandlerContainer::Empty,
                next_record: 0,
            }),
        }
    }

    pub(crate) fn count_service(&self, cpu: CpuId) {
        self.service[cpu.as_usize()].fetch_add(1, Ordering::Relaxed);
    }
}

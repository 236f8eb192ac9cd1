// SPDX-License-Identifier: MPL-2.0

//! The global interrupt gate.
//!
//! A cross-CPU compatibility primitive for legacy callers written against
//! the uniprocessor contract "my local interrupt mask blocks all
//! concurrent interrupt work everywhere". It is a writer-preference lock
//! wrapped around the dispatcher's world, not ambient global state: the
//! writer side is the legacy owner, the reader side is every in-flight
//! dispatch pass and every unit of deferred (bottom-half) work reported
//! by the external soft-interrupt scheduler.
//!
//! The gate is strictly slower than per-source locking and exists only
//! for compatibility; nothing inside this crate takes it.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::cpu::{CpuId, CpuOps};

const NO_OWNER: u32 = u32::MAX;

pub(crate) struct WorldGate {
    /// The owning CPU, or `NO_OWNER`.
    owner: AtomicU32,
    /// CPUs currently spinning in `acquire`. While nonzero, new readers
    /// stand aside, which is what gives writers preference.
    writers_waiting: AtomicUsize,
    /// In-flight interrupt work: dispatch passes plus deferred work.
    active_work: AtomicUsize,
}

// The owner/active_work handshake is Dekker-style: `acquire` publishes
// ownership then re-checks active_work, `enter_work` publishes activity
// then re-checks ownership. Both sides use sequentially consistent
// operations so neither re-check can be reordered before its publish.
impl WorldGate {
    pub(crate) fn new() -> Self {
        Self {
            owner: AtomicU32::new(NO_OWNER),
            writers_waiting: AtomicUsize::new(0),
            active_work: AtomicUsize::new(0),
        }
    }

    pub(crate) fn owner(&self) -> Option<CpuId> {
        let raw = self.owner.load(Ordering::SeqCst);
        (raw != NO_OWNER).then(|| CpuId::new(raw))
    }

    /// Busy-waits until no interrupt work is active anywhere and ownership
    /// is obtained.
    ///
    /// Every `spin_yield` failed spins a local-interrupt window is opened
    /// through `ops`, so delivery on this CPU keeps flowing and other
    /// acquirers are not starved. Not reentrant: a second `acquire` from
    /// the owning CPU spins forever.
    pub(crate) fn acquire<'a>(
        &'a self,
        cpu: CpuId,
        ops: &dyn CpuOps,
        spin_yield: u32,
    ) -> GateGuard<'a> {
        self.writers_waiting.fetch_add(1, Ordering::SeqCst);
        let mut spins: u32 = 0;
        loop {
            if self.active_work.load(Ordering::SeqCst) == 0
                && self
                    .owner
                    .compare_exchange(NO_OWNER, cpu.raw(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                if self.active_work.load(Ordering::SeqCst) == 0 {
                    break;
                }
                // A dispatch pass slipped in between the check and the
                // claim; back out and spin again.
                self.owner.store(NO_OWNER, Ordering::SeqCst);
            }
            spins = spins.wrapping_add(1);
            if spin_yield != 0 && spins % spin_yield == 0 {
                ops.enable_local();
                ops.relax();
                ops.disable_local();
            } else {
                ops.relax();
            }
        }
        self.writers_waiting.fetch_sub(1, Ordering::SeqCst);
        GateGuard { gate: self, cpu }
    }

    /// Enters the reader side for one unit of interrupt work.
    ///
    /// `cpu` is the dispatching CPU, or `None` for deferred work. The
    /// gate owner's own CPU passes through (a legacy owner holds the gate
    /// with local delivery masked, so this matters only to polling and to
    /// tests); everyone else stands aside while the gate is owned or an
    /// acquirer is waiting.
    pub(crate) fn enter_work(&self, cpu: Option<CpuId>) -> WorkGuard<'_> {
        let own = cpu.map(CpuId::raw);
        loop {
            loop {
                let owner = self.owner.load(Ordering::SeqCst);
                if owner == NO_OWNER {
                    if self.writers_waiting.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                } else if Some(owner) == own {
                    break;
                }
                core::hint::spin_loop();
            }
            self.active_work.fetch_add(1, Ordering::SeqCst);
            let owner = self.owner.load(Ordering::SeqCst);
            if owner == NO_OWNER || Some(owner) == own {
                return WorkGuard { gate: self };
            }
            // Lost the race against an acquirer; retract and retry.
            self.active_work.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Ownership of the global interrupt gate.
///
/// Dropping the guard releases the gate.
#[clippy::has_significant_drop]
#[must_use]
pub struct GateGuard<'a> {
    gate: &'a WorldGate,
    cpu: CpuId,
}

impl GateGuard<'_> {
    /// The CPU that acquired the gate.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.owner.store(NO_OWNER, Ordering::SeqCst);
    }
}

pub(crate) struct WorkGuard<'a> {
    gate: &'a WorldGate,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.gate.active_work.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks one unit of deferred (bottom-half) work as in flight.
///
/// The external soft-interrupt scheduler holds one of these around each
/// processing run; the gate's `acquire` waits for all of them to drop.
#[clippy::has_significant_drop]
#[must_use]
pub struct DeferredWorkGuard<'a> {
    _work: WorkGuard<'a>,
}

impl<'a> DeferredWorkGuard<'a> {
    pub(crate) fn new(gate: &'a WorldGate) -> Self {
        Self {
            _work: gate.enter_work(None),
        }
    }
}

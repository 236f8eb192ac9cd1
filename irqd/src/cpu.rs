// SPDX-License-Identifier: MPL-2.0

//! CPU identity and the seam to the architecture layer.

use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert;

/// The largest CPU count a dispatcher can be configured with.
pub(crate) const MAX_CPUS: usize = 64;
const_assert!(MAX_CPUS <= u64::BITS as usize);

/// Identifies one CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(u32);

impl CpuId {
    /// Makes a CPU id from its raw number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw CPU number.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Per-CPU operations provided by the architecture layer.
///
/// The dispatcher never programs the local interrupt mask itself; it only
/// opens short windows through these hooks while the global gate spins, so
/// that delivery on the acquiring CPU is not starved.
pub trait CpuOps: Send + Sync {
    /// Returns the id of the CPU the caller is running on.
    fn current(&self) -> CpuId;

    /// Re-enables interrupt delivery on the local CPU.
    fn enable_local(&self);

    /// Masks interrupt delivery on the local CPU.
    fn disable_local(&self);

    /// Hints that the caller is spinning.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// A [`CpuOps`] that does nothing.
///
/// Suitable for single-CPU bring-up and for tests, where there is no
/// hardware interrupt mask to toggle.
pub struct NullCpuOps;

impl CpuOps for NullCpuOps {
    fn current(&self) -> CpuId {
        CpuId::new(0)
    }

    fn enable_local(&self) {}

    fn disable_local(&self) {}
}

/// The set of CPUs with a valid identity, i.e. eligible as delivery
/// targets for the load balancer.
pub(crate) struct CpuSet {
    bits: AtomicU64,
}

impl CpuSet {
    /// Creates a set with all of the first `nr_cpus` CPUs present.
    pub(crate) fn new_all(nr_cpus: usize) -> Self {
        let bits = if nr_cpus >= u64::BITS as usize {
            u64::MAX
        } else {
            (1u64 << nr_cpus) - 1
        };
        Self {
            bits: AtomicU64::new(bits),
        }
    }

    pub(crate) fn set(&self, cpu: CpuId, present: bool) {
        let bit = 1u64 << cpu.as_usize();
        if present {
            self.bits.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub(crate) fn contains(&self, cpu: CpuId) -> bool {
        self.bits.load(Ordering::Acquire) & (1u64 << cpu.as_usize()) != 0
    }
}

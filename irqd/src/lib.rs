// SPDX-License-Identifier: MPL-2.0

//! Interrupt dispatch core for symmetric-multiprocessor kernels.
//!
//! This crate maps physical interrupt sources to software handlers,
//! delivers hardware events to them with minimal latency, supports shared
//! interrupt lines, and carries a legacy global-interrupt-disable
//! compatibility primitive for code written against a uniprocessor
//! interrupt model.
//!
//! # Shape
//!
//! Everything hangs off one explicitly owned [`IrqDispatcher`]: a fixed,
//! append-only table of interrupt sources, per-CPU per-level pending
//! queues, the [global gate](GateGuard), and a round-robin load balancer.
//! There is no process-wide state; the surrounding kernel owns the
//! dispatcher and hands out shared references.
//!
//! The hardware itself stays outside. The trap layer feeds assertions in
//! through [`IrqDispatcher::deliver`] and runs passes with
//! [`IrqDispatcher::dispatch`]; interrupt-controller drivers implement
//! [`SourceControl`] per source; the architecture layer provides
//! [`CpuOps`].
//!
//! # Ordering guarantees
//!
//! Handlers on one source fire in stable registration order on every
//! dispatch, which keeps cooperating drivers on one legacy-shared line
//! fair. Across sources pending on the same (CPU, level), delivery is
//! most-recent-first: the pending queue is a stack, an intentional
//! deviation from arrival order, acceptable because a pass is expected to
//! fully drain before a same-level re-assertion can occur on that CPU.
//!
//! # Contexts
//!
//! [`deliver`](IrqDispatcher::deliver) and
//! [`dispatch`](IrqDispatcher::dispatch) run at interrupt level;
//! registration, deregistration, enable/disable and rebalancing are
//! process-context operations that may wait only on short-held internal
//! locks. The [gate](IrqDispatcher::acquire_gate) may be taken from
//! either context, but only by legacy callers — new code should lock the
//! data it actually shares.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

extern crate alloc;

mod balance;
mod config;
mod cpu;
mod dispatch;
mod error;
mod gate;
mod handler;
mod pending;
mod registrar;
mod registry;
mod source;
mod stats;

#[cfg(test)]
mod test_util;

pub use config::DispatchConfig;
pub use cpu::{CpuId, CpuOps, NullCpuOps};
pub use error::{Error, Result};
pub use gate::{DeferredWorkGuard, GateGuard};
pub use handler::{IrqCallbackFunction, IrqContext, IrqFlags, IrqHandlerToken, IrqReturn};
pub use registry::{MAX_LEVEL, SYNTHETIC_LEVEL};
pub use source::{SourceControl, SourceId};
pub use stats::SourceSnapshot;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::AtomicU8;

use balance::Balancer;
use cpu::CpuSet;
use gate::WorldGate;
use pending::PendingQueues;
use registry::SourceRegistry;

/// The interrupt-dispatch controller.
///
/// See the [crate docs](crate) for the overall shape. The dispatcher is
/// `Sync`; every operation takes `&self`.
pub struct IrqDispatcher {
    pub(crate) config: DispatchConfig,
    pub(crate) cpu_ops: Box<dyn CpuOps>,
    pub(crate) online: CpuSet,
    pub(crate) registry: SourceRegistry,
    pub(crate) pending: PendingQueues,
    pub(crate) gate: WorldGate,
    pub(crate) balancer: spin::Mutex<Balancer>,
    /// Current dispatch level per CPU, biased by one; guards against
    /// same-or-lower-level nesting.
    pub(crate) dispatch_level: Box<[AtomicU8]>,
}

impl IrqDispatcher {
    /// Creates a dispatcher with no-op CPU operations.
    ///
    /// Suitable before the architecture layer is up, and for tests.
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_cpu_ops(config, Box::new(NullCpuOps))
    }

    /// Creates a dispatcher wired to the architecture layer.
    ///
    /// # Panics
    ///
    /// Panics on a nonsensical configuration: zero CPUs or sources, more
    /// CPUs than the dispatcher supports, or a zero masked slot cap.
    pub fn with_cpu_ops(config: DispatchConfig, cpu_ops: Box<dyn CpuOps>) -> Self {
        assert!(
            config.nr_cpus >= 1 && config.nr_cpus <= cpu::MAX_CPUS,
            "nr_cpus must be in 1..={}",
            cpu::MAX_CPUS
        );
        assert!(config.nr_sources >= 1, "nr_sources must be nonzero");
        assert!(config.masked_slot_cap >= 1, "masked_slot_cap must be nonzero");

        let dispatch_level: Vec<AtomicU8> = (0..config.nr_cpus).map(|_| AtomicU8::new(0)).collect();
        Self {
            cpu_ops,
            online: CpuSet::new_all(config.nr_cpus),
            registry: SourceRegistry::new(config.nr_sources, config.nr_cpus),
            pending: PendingQueues::new(config.nr_cpus),
            gate: WorldGate::new(),
            balancer: spin::Mutex::new(Balancer::new()),
            dispatch_level: dispatch_level.into_boxed_slice(),
            config,
        }
    }

    /// The configuration this dispatcher was built with.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Creates the source descriptor for one physical wire.
    ///
    /// `level` must be in `1..=`[`MAX_LEVEL`], or [`SYNTHETIC_LEVEL`] for
    /// the single synthetic timer-like source, which must have no control
    /// registers. Fails with [`Error::Configuration`] on a malformed
    /// level or discriminant, or when the discriminant already maps to an
    /// initialized, active source — two independent subsystems claiming
    /// one wire is unrecoverable, and boot should halt on it.
    pub fn create_source(
        &self,
        level: u8,
        discriminant: u32,
        control: Option<Arc<dyn SourceControl>>,
    ) -> Result<SourceId> {
        self.registry.create(level, discriminant, control)
    }

    /// Resolves a discriminant to its source, failing with
    /// [`Error::NotFound`] outside the allocated table.
    pub fn lookup(&self, discriminant: u32) -> Result<SourceId> {
        self.registry.lookup(discriminant)
    }

    /// Marks a CPU as having (or no longer having) a valid identity,
    /// i.e. as a load-balancing target.
    pub fn set_cpu_online(&self, cpu: CpuId, online: bool) {
        self.online.set(cpu, online);
    }

    /// Acquires the global interrupt gate for `cpu`.
    ///
    /// Busy-waits until no interrupt work is in flight anywhere,
    /// periodically opening local-interrupt windows through [`CpuOps`].
    /// Compatibility-only; see the crate docs. Not reentrant.
    pub fn acquire_gate(&self, cpu: CpuId) -> GateGuard<'_> {
        self.gate
            .acquire(cpu, &*self.cpu_ops, self.config.gate_spin_yield)
    }

    /// Reports one unit of deferred (bottom-half) work as in flight for
    /// the duration of the returned guard. The soft-interrupt scheduler
    /// holds one around each processing run so the gate can wait for it.
    pub fn deferred_work(&self) -> DeferredWorkGuard<'_> {
        DeferredWorkGuard::new(&self.gate)
    }

    /// The bitmask of levels with queued work on `cpu`, for trap-layer
    /// polling.
    pub fn pending_levels(&self, cpu: CpuId) -> u16 {
        self.pending.pending_levels(cpu)
    }
}

// SPDX-License-Identifier: MPL-2.0

//! The source registry: a fixed, append-only table of interrupt sources.
//!
//! Slots are never reclaimed. A slot may be re-created only while it is
//! inactive (a device-probe retry); claiming an initialized, active slot
//! means two independent subsystems believe they own one physical wire,
//! which is unrecoverable.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use crate::{
    error::{Error, Result},
    handler::HandlerContainer,
    source::{state, SourceControl, SourceId, SourceSlot, NO_LINK, NO_TARGET},
};

/// The highest valid priority level.
pub const MAX_LEVEL: u8 = 15;

/// The level reserved for the single synthetic, timer-like source that
/// has no control registers.
pub const SYNTHETIC_LEVEL: u8 = 0;

/// Sentinel: no slot currently holds the synthetic source.
const NO_SYNTHETIC: u32 = u32::MAX;

pub(crate) struct SourceRegistry {
    slots: Box<[SourceSlot]>,
    /// The discriminant holding the synthetic source, or `NO_SYNTHETIC`.
    synthetic_slot: AtomicU32,
}

impl SourceRegistry {
    pub(crate) fn new(nr_sources: usize, nr_cpus: usize) -> Self {
        let slots: Vec<SourceSlot> = (0..nr_sources).map(|_| SourceSlot::new(nr_cpus)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            synthetic_slot: AtomicU32::new(NO_SYNTHETIC),
        }
    }

    /// Resolves an id to its initialized slot.
    pub(crate) fn get(&self, id: SourceId) -> Result<&SourceSlot> {
        let slot = self.slots.get(id.index()).ok_or(Error::NotFound)?;
        if !slot.init.load(Ordering::Acquire) {
            return Err(Error::NotFound);
        }
        Ok(slot)
    }

    /// Resolves a raw table index coming off a pending-queue link.
    pub(crate) fn slot_by_index(&self, index: usize) -> &SourceSlot {
        &self.slots[index]
    }

    pub(crate) fn iter_init(&self) -> impl Iterator<Item = (SourceId, &SourceSlot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.init.load(Ordering::Acquire))
            .map(|(index, slot)| (SourceId(index as u32), slot))
    }

    pub(crate) fn create(
        &self,
        level: u8,
        discriminant: u32,
        control: Option<Arc<dyn SourceControl>>,
    ) -> Result<SourceId> {
        if level > MAX_LEVEL {
            return Err(Error::Configuration);
        }
        let slot = self
            .slots
            .get(discriminant as usize)
            .ok_or(Error::Configuration)?;

        let mut inner = slot.inner.lock();
        if slot.init.load(Ordering::Acquire) && slot.active.load(Ordering::Acquire) {
            // Two subsystems claiming one physical wire.
            return Err(Error::Configuration);
        }
        if level == SYNTHETIC_LEVEL {
            if control.is_some() {
                return Err(Error::Configuration);
            }
            match self.synthetic_slot.compare_exchange(
                NO_SYNTHETIC,
                discriminant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                // A probe retry on the same inactive slot.
                Err(current) if current == discriminant => {}
                Err(_) => return Err(Error::Configuration),
            }
        } else {
            // Repurposing the synthetic slot at a real level releases
            // the claim.
            let _ = self.synthetic_slot.compare_exchange(
                discriminant,
                NO_SYNTHETIC,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        inner.control = control;
        inner.handlers = HandlerContainer::Empty;
        slot.level.store(level, Ordering::Release);
        slot.active.store(false, Ordering::Release);
        slot.pending.store(false, Ordering::Release);
        slot.dispatch_state.store(state::IDLE, Ordering::Release);
        slot.next_pending.store(NO_LINK, Ordering::Release);
        slot.target_cpu.store(NO_TARGET, Ordering::Release);
        slot.handler_count.store(0, Ordering::Release);
        for counter in slot.service.iter() {
            counter.store(0, Ordering::Relaxed);
        }
        slot.init.store(true, Ordering::Release);

        debug!("interrupt source {discriminant} created at level {level}");
        Ok(SourceId(discriminant))
    }

    pub(crate) fn lookup(&self, discriminant: u32) -> Result<SourceId> {
        let id = SourceId(discriminant);
        self.get(id)?;
        Ok(id)
    }

    /// Whether any active source shares `control` (by pointer identity).
    ///
    /// Used to keep a shared mask register enabled while a sibling of a
    /// dying source still needs delivery.
    pub(crate) fn any_active_sharing(&self, control: &Arc<dyn SourceControl>) -> bool {
        self.iter_init().any(|(_, slot)| {
            if !slot.active.load(Ordering::Acquire) {
                return false;
            }
            let inner = slot.inner.lock();
            inner
                .control
                .as_ref()
                .is_some_and(|other| Arc::ptr_eq(other, control))
        })
    }
}

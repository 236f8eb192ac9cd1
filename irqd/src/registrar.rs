// SPDX-License-Identifier: MPL-2.0

//! Attaching and detaching handlers.
//!
//! All operations here are process-context only: they may wait on a
//! source's short-held container lock, never on hardware, and must not be
//! called from a handler.

use core::sync::atomic::Ordering;

use log::debug;

use crate::{
    error::{Error, Result},
    handler::{HandlerRecord, IrqContext, IrqFlags, IrqHandlerToken, IrqReturn},
    source::{state, SourceId, SourceSlot},
    IrqDispatcher,
};

impl IrqDispatcher {
    /// Attaches a handler to `source` and enables hardware delivery.
    ///
    /// Fails with [`Error::Busy`] when the sharing rules refuse the new
    /// handler (see [`IrqFlags`]) and with [`Error::NotFound`] for an
    /// unknown source. On success, an assertion parked while the source
    /// had no active handler is re-injected into the current CPU's
    /// pending queue, so the activation race loses no event.
    pub fn register<F>(
        &self,
        source: SourceId,
        flags: IrqFlags,
        label: &'static str,
        callback: F,
    ) -> Result<IrqHandlerToken>
    where
        F: Fn(&IrqContext) -> IrqReturn + Send + Sync + 'static,
    {
        let slot = self.registry.get(source)?;

        let mut inner = slot.inner.lock();
        let record_id = inner.next_record;
        let record = HandlerRecord {
            id: record_id,
            flags,
            label,
            callback: alloc::boxed::Box::new(callback),
        };
        inner
            .handlers
            .try_attach(record, self.config.masked_slot_cap)?;
        inner.next_record += 1;
        slot.handler_count
            .store(inner.handlers.len(), Ordering::Release);
        slot.active.store(true, Ordering::Release);
        if let Some(control) = &inner.control {
            control.enable();
        }
        drop(inner);

        debug!("handler \"{}\" registered on source {}", label, source.raw());
        self.requeue_parked(slot, source);
        self.assign_target(source, slot);
        Ok(IrqHandlerToken {
            source,
            record: record_id,
        })
    }

    /// Detaches the handler named by `token`.
    ///
    /// Fails with [`Error::NotFound`] when the token is stale. When the
    /// last handler leaves, the source goes inactive and hardware
    /// delivery is disabled — unless a sibling source sharing the same
    /// control register is still active, in which case the register must
    /// stay enabled on its behalf.
    ///
    /// Does not interrupt an invocation already running on another CPU;
    /// callers needing synchronous teardown must quiesce the device
    /// first.
    ///
    /// # Panics
    ///
    /// Panics when the handler was registered [`STATIC`]: such handlers
    /// must survive for the life of the system.
    ///
    /// [`STATIC`]: IrqFlags::STATIC
    pub fn deregister(&self, token: IrqHandlerToken) -> Result<()> {
        let slot = self.registry.get(token.source)?;

        let mut inner = slot.inner.lock();
        let (flags, label) = match inner.handlers.get(token.record) {
            Some(record) => (record.flags, record.label),
            None => return Err(Error::NotFound),
        };
        assert!(
            !flags.contains(IrqFlags::STATIC),
            "attempt to remove static handler \"{}\" from source {}",
            label,
            token.source.raw()
        );
        let removed = inner.handlers.detach(token.record);
        debug_assert!(removed.is_some());
        slot.handler_count
            .store(inner.handlers.len(), Ordering::Release);

        if !inner.handlers.is_empty() {
            return Ok(());
        }
        slot.active.store(false, Ordering::Release);
        let control = inner.control.clone();
        drop(inner);

        debug!(
            "handler \"{}\" deregistered, source {} now inactive",
            label,
            token.source.raw()
        );
        if let Some(control) = control {
            if !self.registry.any_active_sharing(&control) {
                control.disable();
            }
        }
        Ok(())
    }

    /// Re-enables hardware delivery without touching the attached
    /// handlers. A no-op on a source with none. Re-injects a parked
    /// assertion exactly like `register` does.
    pub fn enable(&self, source: SourceId) -> Result<()> {
        let slot = self.registry.get(source)?;

        let inner = slot.inner.lock();
        if inner.handlers.is_empty() {
            return Ok(());
        }
        slot.active.store(true, Ordering::Release);
        if let Some(control) = &inner.control {
            control.enable();
        }
        drop(inner);

        self.requeue_parked(slot, source);
        Ok(())
    }

    /// Disables hardware delivery without removing handlers. Assertions
    /// arriving while disabled are parked on the source's pending flag.
    pub fn disable(&self, source: SourceId) -> Result<()> {
        let slot = self.registry.get(source)?;

        let inner = slot.inner.lock();
        slot.active.store(false, Ordering::Release);
        if let Some(control) = &inner.control {
            control.disable();
        }
        Ok(())
    }

    /// Moves a parked assertion back into the current CPU's pending
    /// queue, completing the disable/delivery race: set while inactive,
    /// cleared exactly when redelivery is queued.
    fn requeue_parked(&self, slot: &SourceSlot, source: SourceId) {
        if !slot.pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let cpu = self.cpu_ops.current();
        let level = slot.level.load(Ordering::Acquire);
        if slot
            .dispatch_state
            .compare_exchange(
                state::IDLE,
                state::QUEUED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.pending.insert(cpu, level, source, &slot.next_pending);
        } else {
            // A pass is still parking the source (it publishes the mark
            // before stepping back to idle), or a fresh assertion queued
            // it again. Put the mark back so a later enable retries.
            slot.pending.store(true, Ordering::Release);
        }
    }
}

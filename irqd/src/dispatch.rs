// SPDX-License-Identifier: MPL-2.0

//! The dispatch engine.
//!
//! `deliver` is the entry point the trap layer calls, once per physical
//! assertion, on the CPU that observed it, with local delivery masked.
//! `dispatch` drains one (CPU, level) pending slot and invokes handlers.
//!
//! Per-source state machine during one pass:
//! Idle -> Queued (delivery observed it) -> Dispatching (popped, handlers
//! running) -> Idle, or back to a pending mark when the source turned
//! inactive while queued. That pending mark is the authoritative
//! resolution of the disable/delivery race: the assertion is parked on
//! the source and re-injected when a handler attaches again.

use core::sync::atomic::Ordering;

use log::warn;

use crate::{
    cpu::CpuId,
    handler::{IrqContext, IrqReturn},
    pending::NR_LEVELS,
    source::{state, SourceId, NO_LINK, NO_TARGET},
    IrqDispatcher,
};

impl IrqDispatcher {
    /// Accepts one hardware assertion for `source` at `level` on `cpu`.
    ///
    /// Queues the source for the next dispatch pass at that level. A
    /// source already queued coalesces; delivery for a source that was
    /// never created is dropped with a warning (a spurious vector).
    pub fn deliver(&self, cpu: CpuId, level: u8, source: SourceId) {
        debug_assert!(cpu.as_usize() < self.config.nr_cpus);
        debug_assert!((level as usize) < NR_LEVELS);

        let Ok(slot) = self.registry.get(source) else {
            warn!("spurious delivery for unknown source {}", source.raw());
            return;
        };
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
        }
    }

    /// Runs one dispatch pass for `level` on `cpu`.
    ///
    /// Invoked by the trap layer after `deliver`, at interrupt level. The
    /// pass drains the pending slot and walks the chain most recently
    /// queued first; within a source, handlers fire in registration
    /// order. A handler's failure is its own concern — the pass continues
    /// unconditionally through the remaining chain.
    ///
    /// # Panics
    ///
    /// Panics when nested inside a pass of the same or a higher level on
    /// the same CPU; only a strictly higher level may preempt a pass.
    pub fn dispatch(&self, cpu: CpuId, level: u8) {
        assert!((level as usize) < NR_LEVELS);

        // Levels are recorded biased by one so zero can mean "no pass".
        let nesting = &self.dispatch_level[cpu.as_usize()];
        let outer = nesting.load(Ordering::Relaxed);
        assert!(
            outer == 0 || level + 1 > outer,
            "dispatch pass at level {} preempted by level {} on cpu {}",
            outer - 1,
            level,
            cpu.raw()
        );

        // A nested pass is already covered by the outer pass's work
        // guard; standing aside again would deadlock against a gate
        // acquirer waiting for this CPU to finish.
        let _work = (outer == 0).then(|| self.gate.enter_work(Some(cpu)));

        nesting.store(level + 1, Ordering::Relaxed);

        self.pending.clear_level(cpu, level);
        let mut cursor = self.pending.drain(cpu, level);
        while cursor != NO_LINK {
            let slot = self.registry.slot_by_index(cursor as usize);
            let next = slot.next_pending.swap(NO_LINK, Ordering::AcqRel);
            slot.dispatch_state
                .store(state::DISPATCHING, Ordering::Release);

            if !slot.active.load(Ordering::Acquire) {
                // Disabled while queued: park the assertion for
                // redelivery and leave the hardware unacknowledged.
                slot.pending.store(true, Ordering::Release);
                slot.dispatch_state.store(state::IDLE, Ordering::Release);
                cursor = next;
                continue;
            }

            let source = SourceId(cursor);
            let context = IrqContext { cpu, level, source };
            let inner = slot.inner.lock();
            let mut handled = false;
            for record in inner.handlers.iter() {
                if (record.callback)(&context) == IrqReturn::Handled {
                    handled = true;
                }
            }
            let control = inner.control.clone();
            drop(inner);

            slot.count_service(cpu);
            if !handled {
                warn!("unhandled interrupt on source {} at level {}", cursor, level);
            }

            if let Some(control) = &control {
                // Retarget future deliveries before re-arming when the
                // balancer aimed this source somewhere else.
                let target = slot.target_cpu.load(Ordering::Acquire);
                if target != NO_TARGET
                    && target != cpu.raw()
                    && slot.level.load(Ordering::Relaxed) != self.config.pinned_level
                    && !control.retarget(CpuId::new(target))
                {
                    warn!("source {} refused retarget to cpu {}", cursor, target);
                }
            }

            slot.dispatch_state.store(state::IDLE, Ordering::Release);
            if let Some(control) = &control {
                control.clear();
            }
            cursor = next;
        }

        nesting.store(outer, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{dispatcher, FakeControl};
    use crate::{IrqFlags, SourceControl};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;
    use spin::Mutex;

    const CPU: CpuId = CpuId::new(0);

    #[test]
    fn handlers_fire_in_registration_order() {
        let dispatcher = dispatcher(1, 8);
        let source = dispatcher.create_source(5, 0, None).unwrap();
        let trace: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tokens = Vec::new();
        for tag in [1u8, 2, 3] {
            let trace = Arc::clone(&trace);
            tokens.push(
                dispatcher
                    .register(source, IrqFlags::SHARE, "probe", move |_| {
                        trace.lock().push(tag);
                        IrqReturn::Handled
                    })
                    .unwrap(),
            );
        }

        // Other sources pending at the same level must not disturb the
        // within-source order.
        let noise = dispatcher.create_source(5, 1, None).unwrap();
        let _noise_token = dispatcher
            .register(noise, IrqFlags::empty(), "noise", |_| IrqReturn::Handled)
            .unwrap();

        dispatcher.deliver(CPU, 5, noise);
        dispatcher.deliver(CPU, 5, source);
        dispatcher.dispatch(CPU, 5);

        assert_eq!(*trace.lock(), [1, 2, 3]);
    }

    #[test]
    fn shared_line_invokes_each_handler_exactly_once() {
        let dispatcher = dispatcher(1, 8);
        let source = dispatcher.create_source(7, 2, None).unwrap();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&a);
        let _ta = dispatcher
            .register(source, IrqFlags::SHARE, "driver-a", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            })
            .unwrap();
        let hits = Arc::clone(&b);
        let _tb = dispatcher
            .register(source, IrqFlags::SHARE, "driver-b", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Ignored
            })
            .unwrap();

        dispatcher.deliver(CPU, 7, source);
        dispatcher.dispatch(CPU, 7);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disable_deliver_enable_loses_nothing() {
        let dispatcher = dispatcher(1, 32);
        let control = FakeControl::new();
        let source = dispatcher
            .create_source(5, 0x10, Some(Arc::clone(&control) as Arc<dyn SourceControl>))
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let token = dispatcher
            .register(source, IrqFlags::empty(), "net0", move |ctx| {
                assert_eq!(ctx.level, 5);
                seen.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            })
            .unwrap();

        dispatcher.disable(source).unwrap();
        dispatcher.deliver(CPU, 5, source);
        dispatcher.dispatch(CPU, 5);

        // The assertion was parked, not serviced and not dropped.
        let slot = dispatcher.registry.get(source).unwrap();
        assert!(slot.pending.load(Ordering::Acquire));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        dispatcher.enable(source).unwrap();
        dispatcher.dispatch(CPU, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!slot.pending.load(Ordering::Acquire));

        // Exactly one redelivery: nothing remains queued.
        dispatcher.dispatch(CPU, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        dispatcher.deregister(token).unwrap();
    }

    #[test]
    fn queued_deliveries_coalesce() {
        let dispatcher = dispatcher(1, 8);
        let source = dispatcher.create_source(3, 0, None).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let _token = dispatcher
            .register(source, IrqFlags::empty(), "uart", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            })
            .unwrap();

        dispatcher.deliver(CPU, 3, source);
        dispatcher.deliver(CPU, 3, source);
        dispatcher.dispatch(CPU, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pass_survives_a_misbehaving_sibling_source() {
        let dispatcher = dispatcher(1, 8);
        let bad = dispatcher.create_source(6, 0, None).unwrap();
        let good = dispatcher.create_source(6, 1, None).unwrap();

        let _bad_token = dispatcher
            .register(bad, IrqFlags::empty(), "flaky", |_| IrqReturn::Ignored)
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let _good_token = dispatcher
            .register(good, IrqFlags::empty(), "solid", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            })
            .unwrap();

        dispatcher.deliver(CPU, 6, good);
        dispatcher.deliver(CPU, 6, bad);
        dispatcher.dispatch(CPU, 6);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_acknowledges_the_hardware() {
        let dispatcher = dispatcher(1, 8);
        let control = FakeControl::new();
        let source = dispatcher
            .create_source(4, 0, Some(Arc::clone(&control) as Arc<dyn SourceControl>))
            .unwrap();
        let _token = dispatcher
            .register(source, IrqFlags::empty(), "disk", |_| IrqReturn::Handled)
            .unwrap();

        dispatcher.deliver(CPU, 4, source);
        dispatcher.dispatch(CPU, 4);
        assert_eq!(control.clears.load(Ordering::SeqCst), 1);

        // A parked assertion leaves the hardware unacknowledged.
        dispatcher.disable(source).unwrap();
        dispatcher.deliver(CPU, 4, source);
        dispatcher.dispatch(CPU, 4);
        assert_eq!(control.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn higher_level_may_nest() {
        let dispatcher = Arc::new(dispatcher(1, 8));
        let low = dispatcher.create_source(2, 0, None).unwrap();
        let high = dispatcher.create_source(9, 1, None).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let _high_token = dispatcher
            .register(high, IrqFlags::empty(), "timer", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            })
            .unwrap();

        let inner = Arc::clone(&dispatcher);
        let _low_token = dispatcher
            .register(low, IrqFlags::empty(), "slow", move |ctx| {
                // Simulate a level-9 trap preempting this pass.
                inner.deliver(ctx.cpu, 9, high);
                inner.dispatch(ctx.cpu, 9);
                IrqReturn::Handled
            })
            .unwrap();

        dispatcher.deliver(CPU, 2, low);
        dispatcher.dispatch(CPU, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_pass_ignores_a_waiting_gate_acquirer() {
        use core::sync::atomic::AtomicBool;
        use std::thread;
        use std::time::Duration;

        let dispatcher = Arc::new(dispatcher(2, 8));
        let low = dispatcher.create_source(2, 0, None).unwrap();
        let high = dispatcher.create_source(9, 1, None).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let _high_token = dispatcher
            .register(high, IrqFlags::empty(), "timer", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            })
            .unwrap();

        let waiting = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(&dispatcher);
        let observed = Arc::clone(&waiting);
        let _low_token = dispatcher
            .register(low, IrqFlags::empty(), "slow", move |ctx| {
                // Let a gate acquirer start spinning mid-pass, then nest.
                while !observed.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
                thread::sleep(Duration::from_millis(50));
                inner.deliver(ctx.cpu, 9, high);
                inner.dispatch(ctx.cpu, 9);
                IrqReturn::Handled
            })
            .unwrap();

        let acquirer = {
            let dispatcher = Arc::clone(&dispatcher);
            let waiting = Arc::clone(&waiting);
            thread::spawn(move || {
                waiting.store(true, Ordering::SeqCst);
                drop(dispatcher.acquire_gate(CpuId::new(1)));
            })
        };

        dispatcher.deliver(CPU, 2, low);
        dispatcher.dispatch(CPU, 2);
        acquirer.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_retarget_is_tolerated() {
        let dispatcher = dispatcher(2, 8);
        dispatcher.set_cpu_online(CpuId::new(0), false);
        let control = FakeControl::new();
        control.refuse_retarget.store(true, Ordering::SeqCst);
        let source = dispatcher
            .create_source(5, 0, Some(Arc::clone(&control) as Arc<dyn SourceControl>))
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let _token = dispatcher
            .register(source, IrqFlags::empty(), "eth1", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                IrqReturn::Handled
            })
            .unwrap();

        dispatcher.deliver(CPU, 5, source);
        dispatcher.dispatch(CPU, 5);

        // The move was refused; the pass still serviced and re-armed.
        assert!(control.retargets.lock().is_empty());
        assert_eq!(control.clears.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "preempted by level")]
    fn same_level_nesting_is_forbidden() {
        let dispatcher = Arc::new(dispatcher(1, 8));
        let source = dispatcher.create_source(5, 0, None).unwrap();
        let inner = Arc::clone(&dispatcher);
        let _token = dispatcher
            .register(source, IrqFlags::empty(), "recursive", move |ctx| {
                inner.dispatch(ctx.cpu, 5);
                IrqReturn::Handled
            })
            .unwrap();
        dispatcher.deliver(CPU, 5, source);
        dispatcher.dispatch(CPU, 5);
    }

    #[test]
    fn retarget_happens_before_rearm() {
        let dispatcher = dispatcher(2, 8);
        dispatcher.set_cpu_online(CpuId::new(0), false);
        let control = FakeControl::new();
        let source = dispatcher
            .create_source(5, 0, Some(Arc::clone(&control) as Arc<dyn SourceControl>))
            .unwrap();
        let _token = dispatcher
            .register(source, IrqFlags::empty(), "eth1", |_| IrqReturn::Handled)
            .unwrap();

        // The balancer can only pick cpu 1; dispatch on cpu 0 must
        // reprogram the hardware.
        dispatcher.deliver(CPU, 5, source);
        dispatcher.dispatch(CPU, 5);
        assert_eq!(*control.retargets.lock(), [1]);
        assert_eq!(control.clears.load(Ordering::SeqCst), 1);
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Per-CPU, per-level pending queues.
//!
//! Each (CPU, level) pair owns one head word holding the top of an
//! intrusive LIFO of source-table indices; the link field lives in the
//! source slot itself. Draining is a single swap-to-empty, so a dispatch
//! pass picks up the whole chain at once, most recently queued first.
//!
//! The historical design made the push a raw atomic exchange and leaned on
//! the convention that only the owning CPU's delivery path ever pushes to
//! a slot. This implementation keeps the LIFO shape and the calling
//! discipline but strengthens the push to a compare-exchange loop, so
//! correctness no longer depends on the single-producer convention (the
//! process-context re-injection path is a second producer).

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use static_assertions::const_assert;

use crate::{
    cpu::CpuId,
    source::{SourceId, NO_LINK},
};

/// Priority levels 0 through 15.
pub(crate) const NR_LEVELS: usize = 16;
const_assert!(NR_LEVELS <= u16::BITS as usize);

pub(crate) struct PendingQueues {
    /// `nr_cpus * NR_LEVELS` heads, CPU-major.
    heads: Box<[AtomicU32]>,
    /// One bit per level with queued work, per CPU.
    level_masks: Box<[AtomicU16]>,
}

impl PendingQueues {
    pub(crate) fn new(nr_cpus: usize) -> Self {
        let heads: Vec<AtomicU32> = (0..nr_cpus * NR_LEVELS)
            .map(|_| AtomicU32::new(NO_LINK))
            .collect();
        let level_masks: Vec<AtomicU16> = (0..nr_cpus).map(|_| AtomicU16::new(0)).collect();
        Self {
            heads: heads.into_boxed_slice(),
            level_masks: level_masks.into_boxed_slice(),
        }
    }

    fn head(&self, cpu: CpuId, level: u8) -> &AtomicU32 {
        &self.heads[cpu.as_usize() * NR_LEVELS + level as usize]
    }

    /// Pushes `source` as the new head, linking the previous head behind
    /// it through `link` (the source's own `next_pending` field), and
    /// marks the level as pending on `cpu`.
    ///
    /// The caller guarantees the source is not already queued anywhere;
    /// the dispatch state machine's Idle -> Queued transition enforces it.
    pub(crate) fn insert(&self, cpu: CpuId, level: u8, source: SourceId, link: &AtomicU32) {
        let head = self.head(cpu, level);
        let mut old = head.load(Ordering::Acquire);
        loop {
            link.store(old, Ordering::Release);
            match head.compare_exchange_weak(old, source.0, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
        self.level_masks[cpu.as_usize()].fetch_or(1 << level, Ordering::AcqRel);
    }

    /// Swaps the slot to empty and returns the prior chain head (or
    /// [`NO_LINK`]). Called once per dispatch pass.
    pub(crate) fn drain(&self, cpu: CpuId, level: u8) -> u32 {
        self.head(cpu, level).swap(NO_LINK, Ordering::AcqRel)
    }

    /// Clears the pending-level indicator for `level` on `cpu`.
    pub(crate) fn clear_level(&self, cpu: CpuId, level: u8) {
        self.level_masks[cpu.as_usize()].fetch_and(!(1 << level), Ordering::AcqRel);
    }

    /// The levels with queued work on `cpu`, as a bitmask.
    pub(crate) fn pending_levels(&self, cpu: CpuId) -> u16 {
        self.level_masks[cpu.as_usize()].load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::sync::Arc;
    use std::thread;

    fn links(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(NO_LINK)).collect()
    }

    fn collect(queues: &PendingQueues, cpu: CpuId, level: u8, links: &[AtomicU32]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = queues.drain(cpu, level);
        while cursor != NO_LINK {
            out.push(cursor);
            cursor = links[cursor as usize].swap(NO_LINK, Ordering::AcqRel);
        }
        out
    }

    #[test]
    fn drain_returns_most_recent_first() {
        let queues = PendingQueues::new(2);
        let links = links(4);
        let cpu = CpuId::new(1);
        for id in 0..4u32 {
            queues.insert(cpu, 5, SourceId(id), &links[id as usize]);
        }
        assert_eq!(collect(&queues, cpu, 5, &links), [3, 2, 1, 0]);
        // A second drain finds the slot empty.
        assert_eq!(queues.drain(cpu, 5), NO_LINK);
    }

    #[test]
    fn slots_are_independent_per_cpu_and_level() {
        let queues = PendingQueues::new(2);
        let links = links(4);
        queues.insert(CpuId::new(0), 3, SourceId(0), &links[0]);
        queues.insert(CpuId::new(1), 3, SourceId(1), &links[1]);
        queues.insert(CpuId::new(0), 9, SourceId(2), &links[2]);

        assert_eq!(queues.pending_levels(CpuId::new(0)), (1 << 3) | (1 << 9));
        assert_eq!(queues.pending_levels(CpuId::new(1)), 1 << 3);

        assert_eq!(collect(&queues, CpuId::new(0), 3, &links), [0]);
        assert_eq!(collect(&queues, CpuId::new(1), 3, &links), [1]);
        assert_eq!(collect(&queues, CpuId::new(0), 9, &links), [2]);
    }

    #[test]
    fn level_mask_set_and_clear() {
        let queues = PendingQueues::new(1);
        let links = links(1);
        let cpu = CpuId::new(0);
        queues.insert(cpu, 15, SourceId(0), &links[0]);
        assert_eq!(queues.pending_levels(cpu), 1 << 15);
        queues.clear_level(cpu, 15);
        assert_eq!(queues.pending_levels(cpu), 0);
    }

    #[test]
    fn concurrent_pushes_lose_nothing() {
        const PER_THREAD: usize = 64;
        let queues = Arc::new(PendingQueues::new(1));
        let links: Arc<Vec<AtomicU32>> = Arc::new(links(4 * PER_THREAD));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queues = Arc::clone(&queues);
                let links = Arc::clone(&links);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let id = (t * PER_THREAD + i) as u32;
                        queues.insert(CpuId::new(0), 7, SourceId(id), &links[id as usize]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut drained = collect(&queues, CpuId::new(0), 7, &links);
        drained.sort_unstable();
        let expected: Vec<u32> = (0..(4 * PER_THREAD) as u32).collect();
        assert_eq!(drained, expected);
    }
}

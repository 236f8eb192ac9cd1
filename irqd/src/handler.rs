// SPDX-License-Identifier: MPL-2.0

//! Handler records and the per-source handler container.

use alloc::{boxed::Box, vec::Vec};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    cpu::CpuId,
    error::{Error, Result},
    source::SourceId,
};

bitflags! {
    /// Registration flags for an interrupt handler.
    pub struct IrqFlags: u8 {
        /// The handler tolerates siblings on the same source.
        const SHARE = 1 << 0;
        /// A fast-path handler. Without [`SHARE`](Self::SHARE) it owns its
        /// source exclusively; a source never holds fast and non-fast
        /// handlers together.
        const FAST = 1 << 1;
        /// The source multiplexes its handlers behind one hardware mapping
        /// register, bounding how many can attach.
        const MASKED = 1 << 2;
        /// The handler must survive for the life of the system (e.g. the
        /// clock tick). Deregistering it is a fatal programming error.
        const STATIC = 1 << 3;
    }
}

/// What a handler reports back to the dispatch engine.
///
/// On a shared line every attached handler is invoked for every delivery;
/// a handler that finds its device idle reports [`Ignored`](Self::Ignored).
/// The engine never retries or escalates — the report only feeds the
/// unhandled-interrupt diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// The handler serviced its device.
    Handled,
    /// The assertion was not for this handler's device.
    Ignored,
}

/// What the dispatch engine passes to every handler invocation.
#[derive(Clone, Copy, Debug)]
pub struct IrqContext {
    /// The CPU running the dispatch pass.
    pub cpu: CpuId,
    /// The priority level being drained.
    pub level: u8,
    /// The source the assertion arrived on.
    pub source: SourceId,
}

/// Type alias for the irq callback function.
///
/// Device context travels inside the closure: where a C driver would hand
/// over a `void *`, a callback here simply captures what it needs.
pub type IrqCallbackFunction = dyn Fn(&IrqContext) -> IrqReturn + Send + Sync + 'static;

/// The capability returned by a successful registration.
///
/// It names the record without owning it; the record itself stays inside
/// the source's container until a matching deregistration. Tokens are
/// deliberately not `Copy` so a deregistration consumes them.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct IrqHandlerToken {
    pub(crate) source: SourceId,
    pub(crate) record: u64,
}

impl IrqHandlerToken {
    /// Returns the source this token's handler is attached to.
    pub fn source(&self) -> SourceId {
        self.source
    }
}

pub(crate) struct HandlerRecord {
    pub(crate) id: u64,
    pub(crate) flags: IrqFlags,
    pub(crate) label: &'static str,
    pub(crate) callback: Box<IrqCallbackFunction>,
}

/// The handler container of one source.
///
/// Always in exactly one of four shapes: empty, one exclusive record, an
/// append-ordered chain of unmasked-shareable records, or a bounded slot
/// list of masked-shareable records.
pub(crate) enum HandlerContainer {
    Empty,
    Exclusive(HandlerRecord),
    Chain(Vec<HandlerRecord>),
    Slots(SmallVec<[HandlerRecord; 4]>),
}

/// Two records may share a source iff both opted into sharing and they
/// agree on fast-ness and masked-ness.
fn shareable(a: IrqFlags, b: IrqFlags) -> bool {
    let compat = IrqFlags::FAST | IrqFlags::MASKED;
    a.contains(IrqFlags::SHARE) && b.contains(IrqFlags::SHARE) && (a & compat) == (b & compat)
}

impl HandlerContainer {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Exclusive(_) => 1,
            Self::Chain(records) => records.len(),
            Self::Slots(records) => records.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Iterates the records in registration order.
    pub(crate) fn iter(&self) -> core::slice::Iter<'_, HandlerRecord> {
        match self {
            Self::Empty => [].iter(),
            Self::Exclusive(record) => core::slice::from_ref(record).iter(),
            Self::Chain(records) => records.iter(),
            Self::Slots(records) => records.iter(),
        }
    }

    pub(crate) fn get(&self, id: u64) -> Option<&HandlerRecord> {
        self.iter().find(|record| record.id == id)
    }

    /// Attaches `record`, enforcing the sharing and exclusivity rules.
    ///
    /// The second masked-shareable registration promotes a single-record
    /// container to the bounded slot list; registration `slot_cap + 1`
    /// fails with [`Error::Busy`].
    pub(crate) fn try_attach(&mut self, record: HandlerRecord, slot_cap: usize) -> Result<()> {
        match self {
            Self::Empty => {
                *self = Self::Exclusive(record);
                Ok(())
            }
            Self::Exclusive(existing) => {
                if !shareable(existing.flags, record.flags) {
                    return Err(Error::Busy);
                }
                let masked = record.flags.contains(IrqFlags::MASKED);
                if masked && slot_cap < 2 {
                    return Err(Error::Busy);
                }
                let prev = match core::mem::replace(self, Self::Empty) {
                    Self::Exclusive(prev) => prev,
                    _ => unreachable!(),
                };
                *self = if masked {
                    let mut records = SmallVec::new();
                    records.push(prev);
                    records.push(record);
                    Self::Slots(records)
                } else {
                    let mut records = Vec::with_capacity(2);
                    records.push(prev);
                    records.push(record);
                    Self::Chain(records)
                };
                Ok(())
            }
            Self::Chain(records) => {
                if !shareable(records[0].flags, record.flags) {
                    return Err(Error::Busy);
                }
                records.push(record);
                Ok(())
            }
            Self::Slots(records) => {
                if !shareable(records[0].flags, record.flags) || records.len() >= slot_cap {
                    return Err(Error::Busy);
                }
                records.push(record);
                Ok(())
            }
        }
    }

    /// Removes the record named by `id`, collapsing back to `Empty` when
    /// the last record leaves.
    pub(crate) fn detach(&mut self, id: u64) -> Option<HandlerRecord> {
        match self {
            Self::Empty => None,
            Self::Exclusive(record) => {
                if record.id != id {
                    return None;
                }
                match core::mem::replace(self, Self::Empty) {
                    Self::Exclusive(record) => Some(record),
                    _ => unreachable!(),
                }
            }
            Self::Chain(records) => {
                let at = records.iter().position(|record| record.id == id)?;
                let record = records.remove(at);
                if records.is_empty() {
                    *self = Self::Empty;
                }
                Some(record)
            }
            Self::Slots(records) => {
                let at = records.iter().position(|record| record.id == id)?;
                let record = records.remove(at);
                if records.is_empty() {
                    *self = Self::Empty;
                }
                Some(record)
            }
        }
    }
}

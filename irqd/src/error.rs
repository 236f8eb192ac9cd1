// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
///
/// Only recoverable conditions are represented here. The one truly fatal
/// condition — removing a handler registered as
/// [`STATIC`](crate::IrqFlags::STATIC) — is a programming error and panics
/// instead of being returned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// A malformed priority level or discriminant, or two independent
    /// subsystems claiming one physical wire. Returned from source
    /// creation only; boot code is expected to halt on it, since a
    /// double-claimed wire is unrecoverable.
    Configuration,
    /// Conflicting share flags, or a full masked slot list.
    Busy,
    /// A stale handler token, or a discriminant outside the source table.
    NotFound,
}

/// A specialized [`Result`] type for this crate.
///
/// [`Result`]: core::result::Result
pub type Result<T> = core::result::Result<T, Error>;

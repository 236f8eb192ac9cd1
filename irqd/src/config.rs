// SPDX-License-Identifier: MPL-2.0

//! Dispatcher construction parameters.

/// Sizing and hardware-quirk parameters for an [`IrqDispatcher`].
///
/// [`IrqDispatcher`]: crate::IrqDispatcher
#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    /// Number of CPUs the dispatcher serves. At most 64.
    pub nr_cpus: usize,
    /// Size of the source table. Discriminants index into it, so the
    /// valid discriminant range is `0..nr_sources`.
    pub nr_sources: usize,
    /// How many handlers a masked-shareable source can multiplex behind
    /// one hardware mapping register. A historical limit of the target
    /// hardware, not of this crate.
    pub masked_slot_cap: usize,
    /// Priority level the load balancer must never move. Retargeting this
    /// level is known to destabilize certain hardware.
    pub pinned_level: u8,
    /// How many failed spins the gate tolerates between two
    /// local-interrupt windows while acquiring. Zero disables the windows.
    pub gate_spin_yield: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            nr_sources: 64,
            masked_slot_cap: 4,
            pinned_level: 14,
            gate_spin_yield: 64,
        }
    }
}

//! Driver tunables.
//!
//! Every hardware wait in the driver is a bounded busy-poll; the limits below
//! are iteration counts, each iteration being one `spin_loop` hint.

use crate::usb::class::mouse::DeltaMode;

#[derive(Debug, Clone, Copy)]
pub struct XhciConfig {
    /// Upper bound for CONFIG.MaxSlotsEn (the controller may support fewer).
    pub max_slots: u8,
    /// Wait for HCHalted after clearing Run/Stop before a reset.
    pub halt_poll_limit: u32,
    /// Wait for HCRST and CNR to clear.
    pub reset_poll_limit: u32,
    /// Wait for HCHalted to clear after setting Run/Stop.
    pub run_poll_limit: u32,
    /// Wait for a port reset to complete.
    pub port_reset_poll_limit: u32,
    /// Wait for a command completion event.
    pub command_poll_limit: u32,
    /// Wait for an EP0 control transfer to complete.
    pub transfer_poll_limit: u32,
    /// IMOD interval, in 250 ns units.
    pub interrupt_moderation: u16,
    pub mouse_delta_mode: DeltaMode,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            halt_poll_limit: 1_000_000,
            reset_poll_limit: 1_000_000,
            run_poll_limit: 1_000_000,
            port_reset_poll_limit: 1_000_000,
            command_poll_limit: 1_000_000,
            transfer_poll_limit: 1_000_000,
            interrupt_moderation: 4000,
            mouse_delta_mode: DeltaMode::Relative,
        }
    }
}

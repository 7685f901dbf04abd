//! Driver xHCI (USB 3.x).
//!
//! Register access, DMA rings and contexts, the synchronous port
//! configuration path and the event loop that feeds class drivers.

pub mod command_ring;
pub mod configure;
pub mod context;
pub mod controller;
pub mod device;
pub mod event;
pub mod event_ring;
pub mod pending;
pub mod port;
pub mod regs;
pub mod ring;
pub mod trb;

#[cfg(test)]
pub(crate) mod sim;

pub use controller::Controller;
pub use device::DeviceSlot;
pub use event_ring::EventRing;
pub use port::{Port, PortConfigState};
pub use regs::{MmioRegisters, RegisterAccess};
pub use trb::CompletionCode;

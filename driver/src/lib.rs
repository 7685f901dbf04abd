//! xHCI host controller driver with a HID boot-protocol mouse class driver.
//!
//! The controller is brought up with [`Controller::initialize`] and
//! [`Controller::run`], ports are configured one by one with
//! [`Controller::configure_port`], and hardware events are consumed with
//! [`Controller::process_event`]. Decoded mouse movement is delivered to a
//! [`MouseObserver`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod dma;
pub mod usb;
pub mod util;

pub use config::XhciConfig;
pub use dma::{DmaBuffer, DmaPool};
pub use usb::class::mouse::{DeltaMode, MouseObserver, ObserverOverride};
pub use usb::xhci::{Controller, EventRing, Port, PortConfigState};
pub use util::{cause_code, InitFailure, KError, KResult, PortFailure};

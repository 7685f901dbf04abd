//! USB HID boot protocol mouse.

use core::fmt;

use alloc::sync::Arc;

use super::SharedObserver;
use crate::usb::SetupPacket;

/// Receives cursor movement `(dx, dy)`.
pub type MouseObserver = Arc<dyn Fn(i8, i8) + Send + Sync>;

/// Which observer a mouse instance reports to.
#[derive(Clone, Default)]
pub enum ObserverOverride {
    /// The framework default, read on every report.
    #[default]
    UseDefault,
    /// No observer, even if a default is set.
    Cleared,
    Custom(MouseObserver),
}

impl fmt::Debug for ObserverOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserverOverride::UseDefault => write!(f, "UseDefault"),
            ObserverOverride::Cleared => write!(f, "Cleared"),
            ObserverOverride::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How report bytes 1 and 2 become a movement delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaMode {
    /// Boot protocol reports already carry relative movement.
    #[default]
    Relative,
    /// Difference against the previous report, for devices that report a
    /// position.
    Difference,
}

/// HID Subclass
pub const SUBCLASS_BOOT_INTERFACE: u8 = 1;

/// HID Protocol (for Boot Interface subclass)
pub const PROTOCOL_MOUSE: u8 = 2;

/// HID Class Requests
const HID_SET_IDLE: u8 = 0x0A;
const HID_SET_PROTOCOL: u8 = 0x0B;

/// Boot protocol (as opposed to report protocol = 1).
pub const BOOT_PROTOCOL: u8 = 0;

/// Create Setup packet for SET_PROTOCOL
pub fn set_protocol_packet(interface: u8, protocol: u8) -> SetupPacket {
    SetupPacket {
        request_type: 0x21, // Host to Device, Class, Interface
        request: HID_SET_PROTOCOL,
        value: protocol as u16,
        index: interface as u16,
        length: 0,
    }
}

/// Create Setup packet for SET_IDLE (duration 0 = only report on change)
pub fn set_idle_packet(interface: u8, duration: u8) -> SetupPacket {
    SetupPacket {
        request_type: 0x21,
        request: HID_SET_IDLE,
        value: (duration as u16) << 8,
        index: interface as u16,
        length: 0,
    }
}

/// Boot Protocol Mouse Report (3+ bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootMouseReport {
    pub buttons: u8,
    pub x: i8,
    pub y: i8,
    /// Byte 3, zero if the device sends only three bytes.
    pub wheel: i8,
}

impl BootMouseReport {
    pub const MIN_LENGTH: usize = 3;

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::MIN_LENGTH {
            return None;
        }
        Some(Self {
            buttons: data[0],
            x: data[1] as i8,
            y: data[2] as i8,
            wheel: data.get(3).map_or(0, |&b| b as i8),
        })
    }

    pub fn left_button(&self) -> bool {
        (self.buttons & 0x01) != 0
    }

    pub fn right_button(&self) -> bool {
        (self.buttons & 0x02) != 0
    }

    pub fn middle_button(&self) -> bool {
        (self.buttons & 0x04) != 0
    }
}

/// HID mouse state tracker
pub struct HidMouseDriver {
    default_observer: SharedObserver,
    observer: ObserverOverride,
    mode: DeltaMode,
    last_report: BootMouseReport,
}

impl HidMouseDriver {
    pub fn new(default_observer: SharedObserver, mode: DeltaMode) -> Self {
        Self {
            default_observer,
            observer: ObserverOverride::UseDefault,
            mode,
            last_report: BootMouseReport::default(),
        }
    }

    pub fn set_observer(&mut self, observer: ObserverOverride) {
        self.observer = observer;
    }

    pub fn observer(&self) -> &ObserverOverride {
        &self.observer
    }

    pub fn mode(&self) -> DeltaMode {
        self.mode
    }

    pub fn last_report(&self) -> BootMouseReport {
        self.last_report
    }

    /// Decodes one interrupt-IN transfer and notifies the observer.
    /// Returns the delta, or `None` for a malformed report.
    pub fn process_report(&mut self, data: &[u8]) -> Option<(i8, i8)> {
        let Some(report) = BootMouseReport::from_bytes(data) else {
            log::debug!("usb-hid: dropping short mouse report len={}", data.len());
            return None;
        };

        let delta = match self.mode {
            DeltaMode::Relative => (report.x, report.y),
            DeltaMode::Difference => (
                report.x.wrapping_sub(self.last_report.x),
                report.y.wrapping_sub(self.last_report.y),
            ),
        };
        self.last_report = report;

        // Lock released before the callback runs.
        let observer = match &self.observer {
            ObserverOverride::Custom(observer) => Some(observer.clone()),
            ObserverOverride::UseDefault => self.default_observer.read().as_ref().cloned(),
            ObserverOverride::Cleared => None,
        };
        if let Some(observer) = observer {
            observer(delta.0, delta.1);
        }

        Some(delta)
    }
}

//! Root hub ports.

use crate::usb::UsbSpeed;

use super::regs::PortSc;

/// Snapshot of one root hub port, re-read from PORTSC on every
/// [`Controller::port_at`](super::Controller::port_at).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    index: u8,
    connected: bool,
    enabled: bool,
    speed: Option<UsbSpeed>,
    resetting: bool,
    connect_change: bool,
}

impl Port {
    pub(crate) fn from_portsc(index: u8, portsc: PortSc) -> Self {
        let connected = portsc.contains(PortSc::CCS);
        Self {
            index,
            connected,
            enabled: portsc.contains(PortSc::PED),
            speed: if connected {
                UsbSpeed::from_xhci_speed(portsc.speed())
            } else {
                None
            },
            resetting: portsc.contains(PortSc::PR),
            connect_change: portsc.contains(PortSc::CSC),
        }
    }

    /// 1-based port number.
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn speed(&self) -> Option<UsbSpeed> {
        self.speed
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting
    }

    /// CSC: the connection changed since it was last acknowledged.
    pub fn has_connect_change(&self) -> bool {
        self.connect_change
    }
}

/// Progress of `configure_port` for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortConfigState {
    #[default]
    Disconnected,
    Resetting,
    Addressing,
    Configuring,
    Configured,
    Failed,
}

/// Per-port bookkeeping kept by the controller.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PortRecord {
    pub state: PortConfigState,
    /// Slot owned by the device on this port, once addressed.
    pub slot_id: Option<u8>,
}

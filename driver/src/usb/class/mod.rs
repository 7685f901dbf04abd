//! Class driver framework.
//!
//! Class drivers are bound to `(slot, dci)` pairs once a port has been
//! configured and receive the data of every completed transfer on that
//! endpoint. The framework also owns the default mouse observer, shared by
//! handle with every mouse instance.

pub mod mouse;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::RwLock;

use super::class_code;
use mouse::{DeltaMode, HidMouseDriver, MouseObserver, ObserverOverride};

/// Default observer slot, replaced in one store.
pub type SharedObserver = Arc<RwLock<Option<MouseObserver>>>;

/// Class drivers this crate provides, resolved from an interface triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    HidBootMouse,
}

impl ClassKind {
    pub fn resolve(class: u8, subclass: u8, protocol: u8) -> Option<Self> {
        match (class, subclass, protocol) {
            (class_code::HID, mouse::SUBCLASS_BOOT_INTERFACE, mouse::PROTOCOL_MOUSE) => {
                Some(ClassKind::HidBootMouse)
            }
            _ => None,
        }
    }
}

pub enum ClassDriver {
    HidMouse(HidMouseDriver),
}

impl ClassDriver {
    pub fn kind(&self) -> ClassKind {
        match self {
            ClassDriver::HidMouse(_) => ClassKind::HidBootMouse,
        }
    }

    fn handle_transfer(&mut self, data: &[u8]) {
        match self {
            ClassDriver::HidMouse(mouse) => {
                mouse.process_report(data);
            }
        }
    }
}

pub struct ClassDriverFramework {
    bindings: BTreeMap<(u8, u8), ClassDriver>,
    default_mouse_observer: SharedObserver,
}

impl Default for ClassDriverFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassDriverFramework {
    pub fn new() -> Self {
        Self {
            bindings: BTreeMap::new(),
            default_mouse_observer: Arc::new(RwLock::new(None)),
        }
    }

    /// Replaces the default observer. Mouse instances that use the default
    /// pick it up on their next report.
    pub fn set_default_mouse_observer(&self, observer: Option<MouseObserver>) {
        *self.default_mouse_observer.write() = observer;
    }

    pub fn default_mouse_observer(&self) -> SharedObserver {
        self.default_mouse_observer.clone()
    }

    /// Creates the driver instance for `kind` and binds it to the endpoint.
    pub fn bind(&mut self, slot_id: u8, dci: u8, kind: ClassKind, mode: DeltaMode) {
        let driver = match kind {
            ClassKind::HidBootMouse => ClassDriver::HidMouse(HidMouseDriver::new(
                self.default_mouse_observer.clone(),
                mode,
            )),
        };
        log::info!("usb-hid: bound {:?} slot={} dci={}", kind, slot_id, dci);
        self.bindings.insert((slot_id, dci), driver);
    }

    /// Removes every binding of a slot and returns how many there were.
    pub fn unbind_slot(&mut self, slot_id: u8) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|&(slot, _), _| slot != slot_id);
        before - self.bindings.len()
    }

    pub fn is_bound(&self, slot_id: u8, dci: u8) -> bool {
        self.bindings.contains_key(&(slot_id, dci))
    }

    pub fn driver(&self, slot_id: u8, dci: u8) -> Option<&ClassDriver> {
        self.bindings.get(&(slot_id, dci))
    }

    /// Hands transfer data to the bound driver. Returns false if the
    /// endpoint has no binding.
    pub fn dispatch(&mut self, slot_id: u8, dci: u8, data: &[u8]) -> bool {
        match self.bindings.get_mut(&(slot_id, dci)) {
            Some(driver) => {
                driver.handle_transfer(data);
                true
            }
            None => false,
        }
    }

    /// Sets the observer override of every mouse bound on the slot.
    pub fn set_mouse_observer(&mut self, slot_id: u8, observer: ObserverOverride) -> bool {
        let mut found = false;
        for (_, driver) in self.bindings.range_mut((slot_id, 0)..=(slot_id, u8::MAX)) {
            let ClassDriver::HidMouse(mouse) = driver;
            mouse.set_observer(observer.clone());
            found = true;
        }
        found
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

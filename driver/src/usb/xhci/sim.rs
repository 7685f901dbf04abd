//! Simulated xHC for unit tests.
//!
//! Implements [`RegisterAccess`] over a small register model and executes
//! command and transfer rings straight out of (identity-mapped) DMA memory,
//! posting events the way a controller would. Faults are injected through
//! knobs on [`SimXhc`].

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::ptr::{read_volatile, write_volatile};

use crate::usb::UsbSpeed;

use super::regs::RegisterAccess;
use super::trb::{CompletionCode, Trb, TrbType, TRB_SIZE};

const CAP_LENGTH: u64 = 0x20;
const RTS_OFF: u64 = 0x1000;
const DB_OFF: u64 = 0x2000;

const OP_USBCMD: u64 = CAP_LENGTH;
const OP_USBSTS: u64 = CAP_LENGTH + 0x04;
const OP_PAGESIZE: u64 = CAP_LENGTH + 0x08;
const OP_CRCR: u64 = CAP_LENGTH + 0x18;
const OP_DCBAAP: u64 = CAP_LENGTH + 0x30;
const OP_CONFIG: u64 = CAP_LENGTH + 0x38;
const OP_PORTS: u64 = CAP_LENGTH + 0x400;

const IR_IMAN: u64 = RTS_OFF + 0x20;
const IR_IMOD: u64 = RTS_OFF + 0x24;
const IR_ERSTSZ: u64 = RTS_OFF + 0x28;
const IR_ERSTBA: u64 = RTS_OFF + 0x30;
const IR_ERDP: u64 = RTS_OFF + 0x38;

const CMD_RUN: u32 = 1 << 0;
const CMD_HCRST: u32 = 1 << 1;
const STS_HCH: u32 = 1 << 0;
const STS_EINT: u32 = 1 << 3;

const PORT_CCS: u32 = 1 << 0;
const PORT_PED: u32 = 1 << 1;
const PORT_PR: u32 = 1 << 4;
const PORT_PP: u32 = 1 << 9;
const PORT_CSC: u32 = 1 << 17;
const PORT_PEC: u32 = 1 << 18;
const PORT_PRC: u32 = 1 << 21;
const PORT_CHANGE_MASK: u32 = 0x7F << 17;

fn mem_read32(addr: u64) -> u32 {
    // SAFETY: tests hand the controller identity-mapped, leaked memory.
    unsafe { read_volatile(addr as *const u32) }
}

fn mem_write32(addr: u64, value: u32) {
    // SAFETY: see mem_read32.
    unsafe { write_volatile(addr as *mut u32, value) }
}

fn mem_read64(addr: u64) -> u64 {
    (mem_read32(addr) as u64) | ((mem_read32(addr + 4) as u64) << 32)
}

fn read_trb(addr: u64) -> Trb {
    Trb {
        param_lo: mem_read32(addr),
        param_hi: mem_read32(addr + 4),
        status: mem_read32(addr + 8),
        control: mem_read32(addr + 12),
    }
}

fn copy_dwords(from: u64, to: u64, count: u64) {
    for i in 0..count {
        mem_write32(to + i * 4, mem_read32(from + i * 4));
    }
}

/// A device plugged into a simulated port.
#[derive(Debug, Clone)]
pub(crate) struct SimDevice {
    speed: UsbSpeed,
    device: [u8; 18],
    config: Vec<u8>,
}

impl SimDevice {
    pub fn boot_mouse(speed: UsbSpeed) -> Self {
        Self::with_interface(speed, 3, 1, 2)
    }

    /// A device with one interface of the given class triple and one
    /// interrupt-IN endpoint (EP1, 4 bytes).
    pub fn with_interface(speed: UsbSpeed, class: u8, subclass: u8, protocol: u8) -> Self {
        let (bcd_usb, max_packet0) = match speed {
            UsbSpeed::Super | UsbSpeed::SuperPlus => (0x0300u16, 9u8),
            _ => (0x0200, speed.default_max_packet_size() as u8),
        };
        let interval = match speed {
            UsbSpeed::Low | UsbSpeed::Full => 10,
            _ => 4,
        };
        let [bcd_lo, bcd_hi] = bcd_usb.to_le_bytes();
        Self {
            speed,
            device: [
                18, 1, bcd_lo, bcd_hi, 0, 0, 0, max_packet0, 0x6D, 0x04, 0x16, 0xC0, 0x00, 0x01, 1, 2,
                0, 1,
            ],
            config: vec![
                9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
                9, 4, 0, 0, 1, class, subclass, protocol, 0, // interface
                9, 0x21, 0x11, 0x01, 0, 1, 0x22, 52, 0, // HID
                7, 5, 0x81, 3, 4, 0, interval, // endpoint 1 IN interrupt
            ],
        }
    }

    pub fn with_max_packet_size0(mut self, max_packet0: u8) -> Self {
        self.device[7] = max_packet0;
        self
    }

    pub fn config_descriptor(&self) -> Vec<u8> {
        self.config.clone()
    }
}

#[derive(Default)]
struct SimPort {
    device: Option<SimDevice>,
    connected: bool,
    enabled: bool,
    resetting: bool,
    change: u32,
}

#[derive(Debug, Clone, Copy)]
struct SimRing {
    dequeue: u64,
    cycle: bool,
}

impl SimRing {
    fn from_context(ep_context: u64) -> Self {
        let dequeue = mem_read64(ep_context + 8);
        Self {
            dequeue: dequeue & !0xF,
            cycle: dequeue & 1 != 0,
        }
    }

    /// Next TRB owned by the controller, following Link TRBs.
    fn next(&mut self) -> Option<(u64, Trb)> {
        for _ in 0..4 {
            let trb = read_trb(self.dequeue);
            if trb.cycle() != self.cycle {
                return None;
            }
            if trb.trb_type() == TrbType::Link as u8 {
                self.dequeue = trb.pointer();
                if trb.control & 0x2 != 0 {
                    self.cycle = !self.cycle;
                }
                continue;
            }
            let addr = self.dequeue;
            self.dequeue += TRB_SIZE as u64;
            return Some((addr, trb));
        }
        None
    }
}

struct SimSlot {
    port: u8,
    rings: BTreeMap<u8, SimRing>,
    configuration: Option<u8>,
    hid_protocol: Option<u8>,
}

struct SimState {
    hci_version: u16,
    max_slots: u8,
    scratchpad_count: u16,
    context_size: u64,
    ac64: bool,

    stuck_reset: bool,
    stuck_halted: bool,
    sticky_port_reset: bool,
    failed_command: Option<(u8, CompletionCode)>,
    swallowed_command: Option<u8>,
    stalled_request: Option<u8>,
    swallowed_request: Option<u8>,

    usbcmd: u32,
    halted: bool,
    event_interrupt: bool,
    config: u32,
    latched_low: BTreeMap<u64, u32>,
    crcr: u64,
    cr_ring: SimRing,
    dcbaap: u64,
    iman: u32,
    erst: u64,
    er_segment: u64,
    er_size: usize,
    er_enqueue: usize,
    er_cycle: bool,
    erdp: u64,
    erdp_writes: usize,

    ports: Vec<SimPort>,
    slots: BTreeMap<u8, SimSlot>,
    commands: Vec<TrbType>,
}

impl SimState {
    fn reset(&mut self) {
        self.usbcmd = 0;
        self.halted = true;
        self.event_interrupt = false;
        self.config = 0;
        self.crcr = 0;
        self.cr_ring = SimRing {
            dequeue: 0,
            cycle: true,
        };
        self.dcbaap = 0;
        self.iman = 0;
        self.erst = 0;
        self.er_segment = 0;
        self.er_size = 0;
        self.er_enqueue = 0;
        self.er_cycle = true;
        self.erdp = 0;
        self.slots.clear();
    }

    fn read(&self, offset: u64) -> u32 {
        match offset {
            0x00 => CAP_LENGTH as u32 | ((self.hci_version as u32) << 16),
            0x04 => self.max_slots as u32 | (1 << 8) | ((self.ports.len() as u32) << 24),
            0x08 => {
                let hi = ((self.scratchpad_count >> 5) & 0x1F) as u32;
                let lo = (self.scratchpad_count & 0x1F) as u32;
                (hi << 21) | (lo << 27)
            }
            0x10 => {
                (self.ac64 as u32) | if self.context_size == 64 { 1 << 2 } else { 0 }
            }
            0x14 => DB_OFF as u32,
            0x18 => RTS_OFF as u32,
            OP_USBCMD => self.usbcmd,
            OP_USBSTS => {
                (if self.halted { STS_HCH } else { 0 })
                    | (if self.event_interrupt { STS_EINT } else { 0 })
            }
            OP_PAGESIZE => 1,
            OP_CONFIG => self.config,
            IR_IMAN => self.iman,
            o if o >= OP_PORTS && o < OP_PORTS + 0x10 * self.ports.len() as u64 => {
                if (o - OP_PORTS) % 0x10 == 0 {
                    self.portsc(((o - OP_PORTS) / 0x10) as usize)
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn portsc(&self, index: usize) -> u32 {
        let port = &self.ports[index];
        let mut value = PORT_PP | port.change;
        if port.connected {
            value |= PORT_CCS;
            if let Some(device) = &port.device {
                value |= (device.speed.xhci_speed() as u32) << 10;
            }
        }
        if port.enabled {
            value |= PORT_PED;
        }
        if port.resetting {
            value |= PORT_PR;
        }
        value
    }

    /// Low dword of a 64-bit register written earlier.
    fn combined(&mut self, low_offset: u64, high: u32) -> u64 {
        let low = self.latched_low.remove(&low_offset).unwrap_or(0);
        (low as u64) | ((high as u64) << 32)
    }

    fn write(&mut self, offset: u64, value: u32) {
        match offset {
            OP_USBCMD => self.write_usbcmd(value),
            OP_USBSTS => {
                if value & STS_EINT != 0 {
                    self.event_interrupt = false;
                }
            }
            OP_CONFIG => self.config = value,
            o if o == OP_CRCR + 4 => {
                self.crcr = self.combined(OP_CRCR, value);
                self.cr_ring = SimRing {
                    dequeue: self.crcr & !0x3F,
                    cycle: self.crcr & 1 != 0,
                };
            }
            o if o == OP_DCBAAP + 4 => self.dcbaap = self.combined(OP_DCBAAP, value),
            IR_IMAN => {
                let cleared = value & 1;
                self.iman = (value & 0x2) | (self.iman & 1 & !cleared);
            }
            IR_IMOD | IR_ERSTSZ => {}
            o if o == IR_ERSTBA + 4 => {
                self.erst = self.combined(IR_ERSTBA, value);
                self.er_segment = mem_read64(self.erst);
                self.er_size = mem_read32(self.erst + 8) as usize;
                self.er_enqueue = 0;
                self.er_cycle = true;
            }
            o if o == IR_ERDP + 4 => {
                self.erdp = self.combined(IR_ERDP, value);
                self.erdp_writes += 1;
            }
            OP_CRCR | OP_DCBAAP | IR_ERSTBA | IR_ERDP => {
                self.latched_low.insert(offset, value);
            }
            o if o >= OP_PORTS && o < OP_PORTS + 0x10 * self.ports.len() as u64 => {
                if (o - OP_PORTS) % 0x10 == 0 {
                    self.write_portsc(((o - OP_PORTS) / 0x10) as usize, value);
                }
            }
            o if o >= DB_OFF && o < DB_OFF + 4 * 256 => {
                let slot = ((o - DB_OFF) / 4) as u8;
                if slot == 0 {
                    self.run_commands();
                } else if value == 1 {
                    self.run_control(slot);
                }
            }
            _ => {}
        }
    }

    fn write_usbcmd(&mut self, value: u32) {
        if value & CMD_HCRST != 0 {
            if self.stuck_reset {
                self.usbcmd = value;
            } else {
                self.reset();
            }
            return;
        }
        self.usbcmd = value;
        if value & CMD_RUN != 0 {
            if !self.stuck_halted {
                self.halted = false;
            }
        } else {
            self.halted = true;
        }
    }

    fn write_portsc(&mut self, index: usize, value: u32) {
        let port_id = index as u8 + 1;
        let port = &mut self.ports[index];
        port.change &= !(value & PORT_CHANGE_MASK);
        if value & PORT_PED != 0 {
            port.enabled = false;
        }
        if value & PORT_PR != 0 && port.connected {
            if self.sticky_port_reset {
                port.resetting = true;
            } else {
                port.resetting = false;
                port.enabled = true;
                port.change |= PORT_PRC;
                self.post_port_change(port_id);
            }
        }
    }

    fn post(&mut self, mut trb: Trb) {
        if self.er_segment == 0 || self.er_size == 0 {
            return;
        }
        trb.set_cycle(self.er_cycle);
        let addr = self.er_segment + (self.er_enqueue * TRB_SIZE) as u64;
        mem_write32(addr, trb.param_lo);
        mem_write32(addr + 4, trb.param_hi);
        mem_write32(addr + 8, trb.status);
        mem_write32(addr + 12, trb.control);
        self.er_enqueue += 1;
        if self.er_enqueue == self.er_size {
            self.er_enqueue = 0;
            self.er_cycle = !self.er_cycle;
        }
        self.iman |= 1;
        self.event_interrupt = true;
    }

    fn post_port_change(&mut self, port_id: u8) {
        let mut trb = Trb::new();
        trb.param_lo = (port_id as u32) << 24;
        trb.status = (CompletionCode::SUCCESS.0 as u32) << 24;
        trb.set_type(TrbType::PortStatusChange);
        self.post(trb);
    }

    fn post_transfer(&mut self, addr: u64, slot_id: u8, dci: u8, code: CompletionCode, residual: u32) {
        let mut trb = Trb::new();
        trb.set_pointer(addr);
        trb.status = ((code.0 as u32) << 24) | (residual & 0xFF_FFFF);
        trb.set_type(TrbType::TransferEvent);
        trb.control |= ((slot_id as u32) << 24) | ((dci as u32) << 16);
        self.post(trb);
    }

    fn run_commands(&mut self) {
        while let Some((addr, trb)) = self.cr_ring.next() {
            let raw_type = trb.trb_type();
            if let Some(ty) = TrbType::from_raw(raw_type) {
                self.commands.push(ty);
            }
            if self.swallowed_command == Some(raw_type) {
                continue;
            }
            let (code, slot_id) = match self.failed_command {
                Some((ty, code)) if ty == raw_type => (code, 0),
                _ => self.execute(&trb),
            };

            let mut event = Trb::new();
            event.set_pointer(addr);
            event.status = (code.0 as u32) << 24;
            event.set_type(TrbType::CommandCompletion);
            event.control |= (slot_id as u32) << 24;
            self.post(event);
        }
    }

    fn output_context(&self, slot_id: u8) -> u64 {
        mem_read64(self.dcbaap + slot_id as u64 * 8)
    }

    fn execute(&mut self, trb: &Trb) -> (CompletionCode, u8) {
        let slot_id = trb.slot_id();
        let ctx = self.context_size;
        match TrbType::from_raw(trb.trb_type()) {
            Some(TrbType::EnableSlot) => {
                let enabled = (self.config & 0xFF) as u8;
                match (1..=enabled).find(|id| !self.slots.contains_key(id)) {
                    Some(id) => {
                        self.slots.insert(
                            id,
                            SimSlot {
                                port: 0,
                                rings: BTreeMap::new(),
                                configuration: None,
                                hid_protocol: None,
                            },
                        );
                        (CompletionCode::SUCCESS, id)
                    }
                    None => (CompletionCode::NO_SLOTS_AVAILABLE, 0),
                }
            }
            Some(TrbType::DisableSlot) => match self.slots.remove(&slot_id) {
                Some(_) => (CompletionCode::SUCCESS, slot_id),
                None => (CompletionCode::SLOT_NOT_ENABLED, slot_id),
            },
            Some(TrbType::AddressDevice) => {
                if !self.slots.contains_key(&slot_id) {
                    return (CompletionCode::SLOT_NOT_ENABLED, slot_id);
                }
                let input = trb.pointer();
                let output = self.output_context(slot_id);
                if output == 0 {
                    return (CompletionCode::PARAMETER_ERROR, slot_id);
                }
                copy_dwords(input + ctx, output, 8);
                let dw3 = mem_read32(output + 12);
                mem_write32(output + 12, (dw3 & !0xF80000FF) | slot_id as u32 | (2 << 27));
                copy_dwords(input + 2 * ctx, output + ctx, 8);
                let dw0 = mem_read32(output + ctx);
                mem_write32(output + ctx, (dw0 & !0x7) | 1);

                let port = ((mem_read32(input + ctx + 4) >> 16) & 0xFF) as u8;
                let ring = SimRing::from_context(input + 2 * ctx);
                if let Some(slot) = self.slots.get_mut(&slot_id) {
                    slot.port = port;
                    slot.rings.insert(1, ring);
                }
                (CompletionCode::SUCCESS, slot_id)
            }
            Some(TrbType::ConfigureEndpoint) => {
                if !self.slots.contains_key(&slot_id) {
                    return (CompletionCode::SLOT_NOT_ENABLED, slot_id);
                }
                let input = trb.pointer();
                let output = self.output_context(slot_id);
                let add = mem_read32(input + 4);
                if add & 1 != 0 {
                    let entries = mem_read32(input + ctx) & (0x1F << 27);
                    let dw0 = mem_read32(output);
                    mem_write32(output, (dw0 & !(0x1F << 27)) | entries);
                }
                for dci in 2..32u8 {
                    if add & (1 << dci) == 0 {
                        continue;
                    }
                    let from = input + (dci as u64 + 1) * ctx;
                    let to = output + dci as u64 * ctx;
                    copy_dwords(from, to, 8);
                    let dw0 = mem_read32(to);
                    mem_write32(to, (dw0 & !0x7) | 1);
                    let ring = SimRing::from_context(from);
                    if let Some(slot) = self.slots.get_mut(&slot_id) {
                        slot.rings.insert(dci, ring);
                    }
                }
                let dw3 = mem_read32(output + 12);
                mem_write32(output + 12, (dw3 & !(0x1F << 27)) | (3 << 27));
                (CompletionCode::SUCCESS, slot_id)
            }
            Some(TrbType::EvaluateContext) => {
                if !self.slots.contains_key(&slot_id) {
                    return (CompletionCode::SLOT_NOT_ENABLED, slot_id);
                }
                let input = trb.pointer();
                let output = self.output_context(slot_id);
                if mem_read32(input + 4) & (1 << 1) != 0 {
                    // Max Packet Size of EP0
                    let dw1 = mem_read32(input + 2 * ctx + 4);
                    let current = mem_read32(output + ctx + 4);
                    mem_write32(output + ctx + 4, (current & 0xFFFF) | (dw1 & 0xFFFF_0000));
                }
                (CompletionCode::SUCCESS, slot_id)
            }
            _ => (CompletionCode::TRB_ERROR, slot_id),
        }
    }

    fn device_on_slot(&self, slot_id: u8) -> Option<SimDevice> {
        let port = self.slots.get(&slot_id)?.port;
        self.ports.get((port as usize).checked_sub(1)?)?.device.clone()
    }

    /// Runs every control TD queued on EP0 of a slot.
    fn run_control(&mut self, slot_id: u8) {
        let Some(mut ring) = self.slots.get(&slot_id).and_then(|slot| slot.rings.get(&1).copied())
        else {
            return;
        };

        while let Some((setup_addr, setup)) = ring.next() {
            if setup.trb_type() != TrbType::SetupStage as u8 {
                self.post_transfer(setup_addr, slot_id, 1, CompletionCode::TRB_ERROR, 0);
                continue;
            }
            let mut data = None;
            let mut status = ring.next();
            if let Some((addr, trb)) = status {
                if trb.trb_type() == TrbType::DataStage as u8 {
                    data = Some((addr, trb));
                    status = ring.next();
                }
            }
            let Some((status_addr, _)) = status else {
                break;
            };

            let request_type = (setup.param_lo & 0xFF) as u8;
            let request = ((setup.param_lo >> 8) & 0xFF) as u8;
            let value = (setup.param_lo >> 16) as u16;
            if self.swallowed_request == Some(request) {
                continue;
            }
            let response = self.handle_request(slot_id, request_type, request, value);

            match response {
                Some(bytes) => {
                    if let Some((_, trb)) = data {
                        let len = (trb.buffer_length() as usize).min(bytes.len());
                        for (i, byte) in bytes[..len].iter().enumerate() {
                            // SAFETY: see mem_read32.
                            unsafe { write_volatile((trb.pointer() + i as u64) as *mut u8, *byte) };
                        }
                    }
                    self.post_transfer(status_addr, slot_id, 1, CompletionCode::SUCCESS, 0);
                }
                None => {
                    let at = data.map_or(status_addr, |(addr, _)| addr);
                    self.post_transfer(at, slot_id, 1, CompletionCode::STALL, 0);
                }
            }
        }

        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.rings.insert(1, ring);
        }
    }

    /// Device side of a control request: response bytes, or `None` to stall.
    fn handle_request(&mut self, slot_id: u8, request_type: u8, request: u8, value: u16) -> Option<Vec<u8>> {
        if self.stalled_request == Some(request) {
            return None;
        }
        let device = self.device_on_slot(slot_id)?;
        let slot = self.slots.get_mut(&slot_id)?;
        match (request_type, request) {
            (0x80, 6) => match value >> 8 {
                1 => Some(device.device.to_vec()),
                2 => Some(device.config.clone()),
                _ => None,
            },
            (0x00, 9) => {
                slot.configuration = Some(value as u8);
                Some(Vec::new())
            }
            (0x21, 0x0B) => {
                slot.hid_protocol = Some(value as u8);
                Some(Vec::new())
            }
            (0x21, 0x0A) => Some(Vec::new()),
            _ => None,
        }
    }

    fn finish_transfer(&mut self, slot_id: u8, dci: u8, bytes: &[u8], code: Option<CompletionCode>) -> bool {
        let Some(mut ring) = self.slots.get(&slot_id).and_then(|slot| slot.rings.get(&dci).copied())
        else {
            return false;
        };
        let Some((addr, trb)) = ring.next() else {
            return false;
        };
        let requested = trb.buffer_length() as usize;
        let len = requested.min(bytes.len());
        for (i, byte) in bytes[..len].iter().enumerate() {
            // SAFETY: see mem_read32.
            unsafe { write_volatile((trb.pointer() + i as u64) as *mut u8, *byte) };
        }
        let code = code.unwrap_or(if len < requested {
            CompletionCode::SHORT_PACKET
        } else {
            CompletionCode::SUCCESS
        });
        self.post_transfer(addr, slot_id, dci, code, (requested - len) as u32);
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.rings.insert(dci, ring);
        }
        true
    }
}

/// Handle to a simulated controller; clones share the same state.
#[derive(Clone)]
pub(crate) struct SimXhc(Rc<RefCell<SimState>>);

impl SimXhc {
    pub fn new(ports: u8) -> Self {
        let mut state = SimState {
            hci_version: 0x0110,
            max_slots: 16,
            scratchpad_count: 0,
            context_size: 32,
            ac64: true,
            stuck_reset: false,
            stuck_halted: false,
            sticky_port_reset: false,
            failed_command: None,
            swallowed_command: None,
            stalled_request: None,
            swallowed_request: None,
            usbcmd: 0,
            halted: true,
            event_interrupt: false,
            config: 0,
            latched_low: BTreeMap::new(),
            crcr: 0,
            cr_ring: SimRing {
                dequeue: 0,
                cycle: true,
            },
            dcbaap: 0,
            iman: 0,
            erst: 0,
            er_segment: 0,
            er_size: 0,
            er_enqueue: 0,
            er_cycle: true,
            erdp: 0,
            erdp_writes: 0,
            ports: (0..ports).map(|_| SimPort::default()).collect(),
            slots: BTreeMap::new(),
            commands: Vec::new(),
        };
        state.reset();
        Self(Rc::new(RefCell::new(state)))
    }

    pub fn set_hci_version(&self, version: u16) {
        self.0.borrow_mut().hci_version = version;
    }

    pub fn set_scratchpad_count(&self, count: u16) {
        self.0.borrow_mut().scratchpad_count = count;
    }

    pub fn set_context_size(&self, size: u64) {
        self.0.borrow_mut().context_size = size;
    }

    pub fn set_ac64(&self, ac64: bool) {
        self.0.borrow_mut().ac64 = ac64;
    }

    pub fn set_stuck_reset(&self, stuck: bool) {
        self.0.borrow_mut().stuck_reset = stuck;
    }

    pub fn set_stuck_halted(&self, stuck: bool) {
        self.0.borrow_mut().stuck_halted = stuck;
    }

    pub fn set_sticky_port_reset(&self, sticky: bool) {
        self.0.borrow_mut().sticky_port_reset = sticky;
    }

    /// Completes every command of type `ty` with `code` and no side effect.
    pub fn fail_command(&self, ty: TrbType, code: CompletionCode) {
        self.0.borrow_mut().failed_command = Some((ty as u8, code));
    }

    /// Consumes commands of type `ty` without ever completing them.
    pub fn swallow_command(&self, ty: TrbType) {
        self.0.borrow_mut().swallowed_command = Some(ty as u8);
    }

    /// Stalls every control request with this bRequest.
    pub fn stall_request(&self, request: u8) {
        self.0.borrow_mut().stalled_request = Some(request);
    }

    /// Consumes control requests with this bRequest without completing
    /// them.
    pub fn swallow_request(&self, request: u8) {
        self.0.borrow_mut().swallowed_request = Some(request);
    }

    pub fn clear_faults(&self) {
        let mut state = self.0.borrow_mut();
        state.stuck_reset = false;
        state.stuck_halted = false;
        state.sticky_port_reset = false;
        state.failed_command = None;
        state.swallowed_command = None;
        state.stalled_request = None;
        state.swallowed_request = None;
    }

    /// Plugs a device in before the controller is brought up (no event).
    pub fn attach(&self, port: u8, device: SimDevice) {
        let mut state = self.0.borrow_mut();
        let port = &mut state.ports[port as usize - 1];
        port.device = Some(device);
        port.connected = true;
        port.change |= PORT_CSC;
    }

    /// Unplugs a device without posting an event.
    pub fn detach(&self, port: u8) {
        let mut state = self.0.borrow_mut();
        let port = &mut state.ports[port as usize - 1];
        port.device = None;
        port.connected = false;
        port.enabled = false;
        port.resetting = false;
        port.change |= PORT_CSC;
    }

    /// Hot-plug: attach and post a Port Status Change event.
    pub fn connect(&self, port: u8, device: SimDevice) {
        self.attach(port, device);
        self.0.borrow_mut().post_port_change(port);
    }

    /// Hot-unplug: detach and post a Port Status Change event.
    pub fn disconnect(&self, port: u8) {
        self.detach(port);
        let mut state = self.0.borrow_mut();
        state.ports[port as usize - 1].change |= PORT_PEC;
        state.post_port_change(port);
    }

    /// Completes the next queued transfer on an endpoint with `report`
    /// (Short Packet when shorter than requested). Returns false if nothing
    /// was queued.
    pub fn send_report(&self, slot_id: u8, dci: u8, report: &[u8]) -> bool {
        self.0.borrow_mut().finish_transfer(slot_id, dci, report, None)
    }

    /// Completes the next queued transfer with an explicit completion code.
    pub fn complete_transfer(&self, slot_id: u8, dci: u8, bytes: &[u8], code: CompletionCode) -> bool {
        self.0.borrow_mut().finish_transfer(slot_id, dci, bytes, Some(code))
    }

    /// Posts a transfer event that matches no queued TRB.
    pub fn inject_transfer_event(&self, slot_id: u8, dci: u8, code: CompletionCode) {
        self.0.borrow_mut().post_transfer(0, slot_id, dci, code, 0);
    }

    pub fn inject_host_controller_event(&self, code: CompletionCode) {
        let mut trb = Trb::new();
        trb.status = (code.0 as u32) << 24;
        trb.set_type(TrbType::HostController);
        self.0.borrow_mut().post(trb);
    }

    /// TRBs queued on an endpoint ring and not yet completed.
    pub fn queued_transfers(&self, slot_id: u8, dci: u8) -> usize {
        let state = self.0.borrow();
        let Some(mut ring) = state.slots.get(&slot_id).and_then(|slot| slot.rings.get(&dci).copied())
        else {
            return 0;
        };
        let mut count = 0;
        while count < 64 && ring.next().is_some() {
            count += 1;
        }
        count
    }

    pub fn slot_on_port(&self, port: u8) -> Option<u8> {
        let state = self.0.borrow();
        state
            .slots
            .iter()
            .find(|(_, slot)| slot.port == port)
            .map(|(&id, _)| id)
    }

    pub fn enabled_slots(&self) -> usize {
        self.0.borrow().slots.len()
    }

    pub fn configuration(&self, slot_id: u8) -> Option<u8> {
        self.0.borrow().slots.get(&slot_id)?.configuration
    }

    pub fn hid_protocol(&self, slot_id: u8) -> Option<u8> {
        self.0.borrow().slots.get(&slot_id)?.hid_protocol
    }

    pub fn dcbaa_entry(&self, slot_id: u8) -> u64 {
        let state = self.0.borrow();
        if state.dcbaap == 0 {
            return 0;
        }
        state.output_context(slot_id)
    }

    pub fn commands(&self) -> Vec<TrbType> {
        self.0.borrow().commands.clone()
    }

    pub fn max_slots_enabled(&self) -> u8 {
        (self.0.borrow().config & 0xFF) as u8
    }

    pub fn dcbaap(&self) -> u64 {
        self.0.borrow().dcbaap
    }

    pub fn crcr(&self) -> u64 {
        self.0.borrow().crcr
    }

    pub fn interrupter_enabled(&self) -> bool {
        self.0.borrow().iman & 0x2 != 0
    }

    pub fn erdp(&self) -> u64 {
        self.0.borrow().erdp
    }

    pub fn erdp_writes(&self) -> usize {
        self.0.borrow().erdp_writes
    }

    pub fn port_change_bits(&self, port: u8) -> u32 {
        self.0.borrow().ports[port as usize - 1].change
    }
}

impl RegisterAccess for SimXhc {
    fn read32(&self, offset: u64) -> u32 {
        self.0.borrow().read(offset)
    }

    fn write32(&mut self, offset: u64, value: u32) {
        self.0.borrow_mut().write(offset, value);
    }
}

//! xHCI register access.
//!
//! Capability, operational, runtime (interrupter 0) and doorbell registers
//! are reached through a [`RegisterAccess`] backend: volatile MMIO on real
//! hardware, a simulated controller in tests.

use core::ptr::{read_volatile, write_volatile};

use bitflags::bitflags;
use x86_64::VirtAddr;

/// 32-bit register window. Offsets are relative to the capability base.
pub trait RegisterAccess {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&mut self, offset: u64, value: u32);

    fn read64(&self, offset: u64) -> u64 {
        (self.read32(offset) as u64) | ((self.read32(offset + 4) as u64) << 32)
    }

    /// Low dword first, then high; the controller latches 64-bit pointers on
    /// the high write.
    fn write64(&mut self, offset: u64, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Memory-mapped register window.
pub struct MmioRegisters {
    base: VirtAddr,
}

impl MmioRegisters {
    /// # Safety
    /// `base` must map the controller's capability registers (and everything
    /// DBOFF/RTSOFF point to) for the lifetime of this value.
    pub unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read32(&self, offset: u64) -> u32 {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { read_volatile((self.base + offset).as_ptr::<u32>()) }
    }

    fn write32(&mut self, offset: u64, value: u32) {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { write_volatile((self.base + offset).as_mut_ptr::<u32>(), value) }
    }
}

// Capability registers
const CAPLENGTH: u64 = 0x00;
const HCSPARAMS1: u64 = 0x04;
const HCSPARAMS2: u64 = 0x08;
const HCCPARAMS1: u64 = 0x10;
const DBOFF: u64 = 0x14;
const RTSOFF: u64 = 0x18;

// Operational registers
const USBCMD: u64 = 0x00;
const USBSTS: u64 = 0x04;
const PAGESIZE: u64 = 0x08;
const CRCR: u64 = 0x18;
const DCBAAP: u64 = 0x30;
const CONFIG: u64 = 0x38;
const PORT_BASE: u64 = 0x400;
const PORT_STRIDE: u64 = 0x10;

// Interrupter 0
const IR0: u64 = 0x20;
const IMAN: u64 = 0x00;
const IMOD: u64 = 0x04;
const ERSTSZ: u64 = 0x08;
const ERSTBA: u64 = 0x10;
const ERDP: u64 = 0x18;

/// Event Handler Busy, written back with ERDP to acknowledge.
pub const ERDP_EHB: u64 = 1 << 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RUN   = 1 << 0;
        const HCRST = 1 << 1;
        const INTE  = 1 << 2;
        const HSEE  = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        const HCH  = 1 << 0;
        const HSE  = 1 << 2;
        const EINT = 1 << 3;
        const PCD  = 1 << 4;
        const CNR  = 1 << 11;
        const HCE  = 1 << 12;
    }
}

bitflags! {
    /// PORTSC. Bits 5..=8 (link state) and 10..=13 (speed) are fields, kept
    /// through `from_bits_retain`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        const CCS = 1 << 0;
        const PED = 1 << 1;
        const OCA = 1 << 3;
        const PR  = 1 << 4;
        const PP  = 1 << 9;
        const LWS = 1 << 16;
        const CSC = 1 << 17;
        const PEC = 1 << 18;
        const WRC = 1 << 19;
        const OCC = 1 << 20;
        const PRC = 1 << 21;
        const PLC = 1 << 22;
        const CEC = 1 << 23;
        const CAS = 1 << 24;
        const WCE = 1 << 25;
        const WDE = 1 << 26;
        const WOE = 1 << 27;
        const DR  = 1 << 30;
        const WPR = 1 << 31;
    }
}

impl PortSc {
    /// Write-1-to-clear status change bits.
    pub const CHANGE_BITS: Self = Self::CSC
        .union(Self::PEC)
        .union(Self::WRC)
        .union(Self::OCC)
        .union(Self::PRC)
        .union(Self::PLC)
        .union(Self::CEC);

    /// Read/write bits that must be written back unchanged.
    pub const PRESERVE: Self = Self::PP.union(Self::WCE).union(Self::WDE).union(Self::WOE);

    /// Protocol speed ID (bits 10..=13).
    pub fn speed(self) -> u8 {
        ((self.bits() >> 10) & 0xF) as u8
    }

    /// Value to write back: only the preserved RW bits, so that no change
    /// bit is cleared by accident and PED is never written as 1.
    pub fn write_base(self) -> Self {
        self & Self::PRESERVE
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Iman: u32 {
        const IP = 1 << 0;
        const IE = 1 << 1;
    }
}

/// Values decoded from the capability registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// BCD, e.g. 0x0110 for 1.1.
    pub hci_version: u16,
    pub max_slots: u8,
    pub max_ports: u8,
    /// 32 or 64 bytes.
    pub context_size: usize,
    pub scratchpad_count: u16,
    pub ac64: bool,
}

/// Register map of one controller over a backend.
pub struct XhciRegisters<R> {
    io: R,
    op: u64,
    rt: u64,
    db: u64,
}

impl<R: RegisterAccess> XhciRegisters<R> {
    pub fn new(io: R) -> Self {
        let cap_length = (io.read32(CAPLENGTH) & 0xFF) as u64;
        let db = (io.read32(DBOFF) & !0x3) as u64;
        let rt = (io.read32(RTSOFF) & !0x1F) as u64;
        Self {
            io,
            op: cap_length,
            rt,
            db,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let hcsparams1 = self.io.read32(HCSPARAMS1);
        let hcsparams2 = self.io.read32(HCSPARAMS2);
        let hccparams1 = self.io.read32(HCCPARAMS1);

        let scratchpad_hi = ((hcsparams2 >> 21) & 0x1F) as u16;
        let scratchpad_lo = ((hcsparams2 >> 27) & 0x1F) as u16;

        Capabilities {
            hci_version: (self.io.read32(CAPLENGTH) >> 16) as u16,
            max_slots: (hcsparams1 & 0xFF) as u8,
            max_ports: (hcsparams1 >> 24) as u8,
            context_size: if hccparams1 & (1 << 2) != 0 { 64 } else { 32 },
            scratchpad_count: (scratchpad_hi << 5) | scratchpad_lo,
            ac64: hccparams1 & 1 != 0,
        }
    }

    pub fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(self.io.read32(self.op + USBCMD))
    }

    pub fn set_usbcmd(&mut self, value: UsbCmd) {
        self.io.write32(self.op + USBCMD, value.bits());
    }

    pub fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.io.read32(self.op + USBSTS))
    }

    /// USBSTS change bits are RW1C; only the given bits are cleared.
    pub fn ack_usbsts(&mut self, bits: UsbSts) {
        self.io.write32(self.op + USBSTS, bits.bits());
    }

    pub fn page_size(&self) -> u32 {
        self.io.read32(self.op + PAGESIZE) & 0xFFFF
    }

    pub fn set_crcr(&mut self, value: u64) {
        self.io.write64(self.op + CRCR, value);
    }

    pub fn set_dcbaap(&mut self, addr: u64) {
        self.io.write64(self.op + DCBAAP, addr);
    }

    pub fn set_max_slots_enabled(&mut self, slots: u8) {
        let config = self.io.read32(self.op + CONFIG);
        self.io
            .write32(self.op + CONFIG, (config & !0xFF) | slots as u32);
    }

    fn portsc_offset(&self, port: u8) -> u64 {
        self.op + PORT_BASE + (port as u64 - 1) * PORT_STRIDE
    }

    /// PORTSC of a 1-based port.
    pub fn portsc(&self, port: u8) -> PortSc {
        PortSc::from_bits_retain(self.io.read32(self.portsc_offset(port)))
    }

    pub fn write_portsc(&mut self, port: u8, value: PortSc) {
        let offset = self.portsc_offset(port);
        self.io.write32(offset, value.bits());
    }

    pub fn iman(&self) -> Iman {
        Iman::from_bits_retain(self.io.read32(self.rt + IR0 + IMAN))
    }

    pub fn set_iman(&mut self, value: Iman) {
        self.io.write32(self.rt + IR0 + IMAN, value.bits());
    }

    pub fn set_imod(&mut self, interval: u16) {
        self.io.write32(self.rt + IR0 + IMOD, interval as u32);
    }

    pub fn set_erstsz(&mut self, segments: u16) {
        self.io.write32(self.rt + IR0 + ERSTSZ, segments as u32);
    }

    pub fn set_erstba(&mut self, addr: u64) {
        self.io.write64(self.rt + IR0 + ERSTBA, addr);
    }

    pub fn set_erdp(&mut self, value: u64) {
        self.io.write64(self.rt + IR0 + ERDP, value);
    }

    /// Doorbell `slot` (0 = host controller) with the given target
    /// (0 = command ring, otherwise the endpoint DCI).
    pub fn ring_doorbell(&mut self, slot: u8, target: u8) {
        self.io.write32(self.db + slot as u64 * 4, target as u32);
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &R {
        &self.io
    }
}

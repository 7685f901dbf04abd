//! xHCI controller: bring-up, run, port access and command issue.

use alloc::vec::Vec;

use x86_64::VirtAddr;

use crate::config::XhciConfig;
use crate::dma::{self, DmaBuffer, DmaPool, PAGE_SIZE};
use crate::usb::class::mouse::{MouseObserver, ObserverOverride};
use crate::usb::class::ClassDriverFramework;
use crate::usb::SetupPacket;
use crate::util::{InitFailure, KError, KResult, PortFailure};

use super::command_ring::CommandRing;
use super::device::DeviceSlot;
use super::event_ring::{EventRing, EVENT_RING_SIZE};
use super::pending::{CommandKind, CommandResult, PendingRequests};
use super::port::{Port, PortConfigState, PortRecord};
use super::regs::{Capabilities, Iman, MmioRegisters, RegisterAccess, UsbCmd, UsbSts, XhciRegisters};
use super::trb::{SetupTransferType, Trb};

/// Lowest interface version this driver programs (0.96).
const MIN_HCI_VERSION: u16 = 0x0096;

/// Addressing limit of controllers without AC64.
const DMA32_LIMIT: u64 = 1 << 32;

/// Scratchpad buffer array and the pages it points to.
struct Scratchpad {
    array: Option<DmaBuffer>,
    pages: Vec<DmaBuffer>,
}

impl Scratchpad {
    fn allocate(pool: &mut DmaPool, count: u16) -> Option<Self> {
        let mut scratchpad = Scratchpad {
            array: None,
            pages: Vec::new(),
        };
        if count == 0 {
            return Some(scratchpad);
        }

        let array = pool.allocate(count as usize * 8, 64)?;
        scratchpad.array = Some(array);
        for i in 0..count as usize {
            let Some(page) = pool.allocate(PAGE_SIZE, PAGE_SIZE) else {
                scratchpad.release(pool);
                return None;
            };
            array.write_u64(i * 8, page.phys().as_u64());
            scratchpad.pages.push(page);
        }
        Some(scratchpad)
    }

    fn release(self, pool: &mut DmaPool) {
        for page in self.pages {
            pool.free(page);
        }
        if let Some(array) = self.array {
            pool.free(array);
        }
    }
}

/// Everything allocated by `initialize`.
pub(super) struct HostMemory {
    pub dcbaa: DmaBuffer,
    scratchpad: Scratchpad,
    pub command_ring: CommandRing,
    pub event_ring: EventRing,
}

impl HostMemory {
    fn allocate(pool: &mut DmaPool, slots: u8, scratchpad_count: u16) -> Option<Self> {
        let dcbaa = pool.allocate((slots as usize + 1) * 8, 64)?;
        let Some(scratchpad) = Scratchpad::allocate(pool, scratchpad_count) else {
            pool.free(dcbaa);
            return None;
        };
        if let Some(array) = &scratchpad.array {
            dcbaa.write_u64(0, array.phys().as_u64());
        }
        let Some(command_ring) = CommandRing::new(pool) else {
            scratchpad.release(pool);
            pool.free(dcbaa);
            return None;
        };
        let Some(event_ring) = EventRing::new(pool, EVENT_RING_SIZE) else {
            command_ring.release(pool);
            scratchpad.release(pool);
            pool.free(dcbaa);
            return None;
        };
        Some(Self {
            dcbaa,
            scratchpad,
            command_ring,
            event_ring,
        })
    }
}

/// xHCI Controller
pub struct Controller<R: RegisterAccess = MmioRegisters> {
    pub(super) regs: XhciRegisters<R>,
    pub(super) pool: DmaPool,
    pub(super) config: XhciConfig,
    pub(super) caps: Capabilities,
    pub(super) memory: Option<HostMemory>,
    /// Indexed by slot ID; entry 0 is unused.
    pub(super) slots: Vec<Option<DeviceSlot>>,
    /// Indexed by port number - 1.
    pub(super) ports: Vec<PortRecord>,
    pub(super) pending: PendingRequests,
    pub(super) classes: ClassDriverFramework,
}

impl Controller<MmioRegisters> {
    /// Controller at `mmio_base`, using the driver's built-in DMA arena.
    ///
    /// # Safety
    /// `mmio_base` must be the mapped BAR0 of an xHCI controller, and both the
    /// register window and the DMA arena must be identity mapped for the
    /// controller.
    pub unsafe fn new(mmio_base: u64) -> Self {
        let regs = unsafe { MmioRegisters::new(VirtAddr::new_truncate(mmio_base)) };
        let pool = dma::take_static_pool().unwrap_or_else(|| {
            log::warn!("xhci: static dma arena already taken");
            DmaPool::empty()
        });
        Self::with_parts(regs, pool, XhciConfig::default())
    }
}

impl<R: RegisterAccess> Controller<R> {
    pub fn with_parts(io: R, pool: DmaPool, config: XhciConfig) -> Self {
        let regs = XhciRegisters::new(io);
        let caps = regs.capabilities();
        log::info!(
            "xhci: version={:#x} max_slots={} max_ports={} ctx_size={} scratchpad={}",
            caps.hci_version,
            caps.max_slots,
            caps.max_ports,
            caps.context_size,
            caps.scratchpad_count
        );
        Self {
            regs,
            pool,
            config,
            caps,
            memory: None,
            slots: Vec::new(),
            ports: (0..caps.max_ports).map(|_| PortRecord::default()).collect(),
            pending: PendingRequests::new(),
            classes: ClassDriverFramework::new(),
        }
    }

    /// Resets the controller and programs the DCBAA, the command ring and the
    /// primary interrupter. Leaves the controller halted.
    pub fn initialize(&mut self) -> KResult<()> {
        if self.memory.is_some() {
            return Err(InitFailure::AlreadyInitialized.into());
        }
        if self.caps.hci_version < MIN_HCI_VERSION {
            return Err(InitFailure::UnsupportedVersion(self.caps.hci_version).into());
        }
        let page_size = self.regs.page_size();
        if page_size & 1 == 0 {
            return Err(InitFailure::UnsupportedPageSize(page_size).into());
        }
        if !self.caps.ac64 && self.pool.phys_end() > DMA32_LIMIT {
            return Err(InitFailure::DmaNotAddressable.into());
        }

        self.halt()?;
        self.reset()?;

        let slots = self.caps.max_slots.min(self.config.max_slots);
        self.regs.set_max_slots_enabled(slots);

        let memory = HostMemory::allocate(&mut self.pool, slots, self.caps.scratchpad_count)
            .ok_or(InitFailure::OutOfDmaMemory)?;

        self.regs.set_dcbaap(memory.dcbaa.phys().as_u64());
        self.regs.set_crcr(memory.command_ring.crcr_value());

        let event_ring = &memory.event_ring;
        self.regs.set_erstsz(event_ring.segment_count());
        self.regs.set_erdp(event_ring.dequeue_pointer());
        self.regs.set_erstba(event_ring.erst_phys());
        self.regs.set_imod(self.config.interrupt_moderation);
        self.regs.set_iman(Iman::IE | Iman::IP);

        let cmd = self.regs.usbcmd();
        self.regs.set_usbcmd(cmd | UsbCmd::INTE);

        self.slots = (0..=slots).map(|_| None).collect();
        self.memory = Some(memory);

        log::info!("xhci: initialized slots={}", slots);
        Ok(())
    }

    fn halt(&mut self) -> KResult<()> {
        let cmd = self.regs.usbcmd();
        if !cmd.contains(UsbCmd::RUN) && self.regs.usbsts().contains(UsbSts::HCH) {
            return Ok(());
        }
        self.regs.set_usbcmd(cmd - UsbCmd::RUN);
        if self.wait(self.config.halt_poll_limit, |regs| regs.usbsts().contains(UsbSts::HCH)) {
            Ok(())
        } else {
            Err(InitFailure::HaltTimeout.into())
        }
    }

    fn reset(&mut self) -> KResult<()> {
        let cmd = self.regs.usbcmd();
        self.regs.set_usbcmd(cmd | UsbCmd::HCRST);
        let done = self.wait(self.config.reset_poll_limit, |regs| {
            !regs.usbcmd().contains(UsbCmd::HCRST) && !regs.usbsts().contains(UsbSts::CNR)
        });
        if done {
            Ok(())
        } else {
            Err(InitFailure::ResetTimeout.into())
        }
    }

    /// Bounded busy-poll on a register condition.
    pub(super) fn wait(&self, limit: u32, mut done: impl FnMut(&XhciRegisters<R>) -> bool) -> bool {
        for _ in 0..limit {
            if done(&self.regs) {
                return true;
            }
            core::hint::spin_loop();
        }
        done(&self.regs)
    }

    /// Sets Run/Stop and waits for the controller to leave the halted state.
    pub fn run(&mut self) -> KResult<()> {
        if self.memory.is_none() {
            return Err(InitFailure::NotInitialized.into());
        }
        let cmd = self.regs.usbcmd();
        self.regs.set_usbcmd(cmd | UsbCmd::RUN);
        if !self.wait(self.config.run_poll_limit, |regs| !regs.usbsts().contains(UsbSts::HCH)) {
            log::warn!("xhci: controller still halted after run");
            return Err(KError::ControllerHalted);
        }
        log::info!("xhci: running");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.memory.is_some() && !self.regs.usbsts().contains(UsbSts::HCH)
    }

    /// The primary event ring, once initialized.
    pub fn primary_event_ring(&self) -> Option<&EventRing> {
        self.memory.as_ref().map(|memory| &memory.event_ring)
    }

    /// Shorthand for `primary_event_ring().has_front()`.
    pub fn has_pending_event(&self) -> bool {
        self.primary_event_ring().is_some_and(EventRing::has_front)
    }

    pub fn max_ports(&self) -> u8 {
        self.caps.max_ports
    }

    /// Slots enabled in CONFIG (0 before `initialize`).
    pub fn max_slots(&self) -> u8 {
        self.slots.len().saturating_sub(1) as u8
    }

    pub(super) fn check_port(&self, index: u8) -> KResult<()> {
        if index == 0 || index > self.caps.max_ports {
            return Err(KError::InvalidPort(index));
        }
        Ok(())
    }

    /// Fresh snapshot of the 1-based port `index`.
    pub fn port_at(&self, index: u8) -> KResult<Port> {
        self.check_port(index)?;
        Ok(Port::from_portsc(index, self.regs.portsc(index)))
    }

    pub fn port_state(&self, index: u8) -> KResult<PortConfigState> {
        self.check_port(index)?;
        Ok(self.ports[index as usize - 1].state)
    }

    pub fn device(&self, slot_id: u8) -> Option<&DeviceSlot> {
        self.slots.get(slot_id as usize)?.as_ref()
    }

    pub fn class_drivers(&self) -> &ClassDriverFramework {
        &self.classes
    }

    /// Replaces the observer used by every mouse left on `UseDefault`.
    pub fn set_default_mouse_observer(&self, observer: Option<MouseObserver>) {
        self.classes.set_default_mouse_observer(observer);
    }

    /// Overrides the observer of the mouse bound on `slot_id`. Returns false
    /// if no mouse is bound there.
    pub fn set_mouse_observer(&mut self, slot_id: u8, observer: ObserverOverride) -> bool {
        self.classes.set_mouse_observer(slot_id, observer)
    }

    pub(super) fn memory_mut(&mut self) -> KResult<&mut HostMemory> {
        self.memory
            .as_mut()
            .ok_or(KError::Initialization(InitFailure::NotInitialized))
    }

    /// Queues a command, rings doorbell 0 and pumps events until its
    /// completion arrives.
    pub(super) fn execute_command(&mut self, trb: Trb) -> KResult<CommandResult> {
        let addr = self.memory_mut()?.command_ring.push(trb)?;
        self.pending.insert_command(addr, CommandKind::Awaited);
        self.regs.ring_doorbell(0, 0);

        for _ in 0..self.config.command_poll_limit {
            if let Some(result) = self.pending.take_command(addr) {
                if !result.code.is_success() {
                    return Err(KError::Command(result.code));
                }
                return Ok(result);
            }
            self.pump_event();
        }

        self.pending.cancel_command(addr);
        log::warn!("xhci: command timeout trb={:#x}", addr);
        Err(PortFailure::CommandTimeout.into())
    }

    /// Queues a Disable Slot whose completion returns the slot's memory.
    pub(super) fn queue_disable_slot(&mut self, slot_id: u8) -> KResult<()> {
        let addr = self.memory_mut()?.command_ring.push(Trb::disable_slot(slot_id))?;
        self.pending.insert_command(addr, CommandKind::DisableSlot { slot_id });
        self.regs.ring_doorbell(0, 0);
        Ok(())
    }

    /// Runs one control transfer on EP0 of `slot_id`. Data stages use the
    /// slot's control buffer.
    pub(super) fn control_transfer(&mut self, slot_id: u8, setup: SetupPacket) -> KResult<()> {
        let device = self
            .slots
            .get_mut(slot_id as usize)
            .and_then(Option::as_mut)
            .ok_or(PortFailure::InvalidSlotId(slot_id))?;

        let has_data = setup.length > 0;
        let dir_in = setup.is_device_to_host();
        let transfer_type = match (has_data, dir_in) {
            (false, _) => SetupTransferType::NoData,
            (true, true) => SetupTransferType::In,
            (true, false) => SetupTransferType::Out,
        };
        let length = (setup.length as usize).min(device.control_buffer.len()) as u32;

        // The TD is queued whole or not at all.
        let stages = if has_data { 3 } else { 2 };
        if device.ep0.available() < stages {
            return Err(KError::RingFull);
        }
        device.ep0.push(Trb::setup_stage(&setup, transfer_type))?;
        if has_data {
            let buffer = device.control_buffer.phys().as_u64();
            device.ep0.push(Trb::data_stage(buffer, length, dir_in))?;
        }
        let status = device.ep0.push(Trb::status_stage(!(has_data && dir_in)))?;

        self.pending.insert_control(slot_id, status);
        self.regs.ring_doorbell(slot_id, 1);

        for _ in 0..self.config.transfer_poll_limit {
            if let Some(code) = self.pending.take_control(slot_id) {
                if let Some(device) = self.slots.get_mut(slot_id as usize).and_then(Option::as_mut) {
                    device.ep0.mark_consumed(status);
                }
                if !code.is_success() {
                    log::warn!(
                        "xhci: control request={:#x} slot={} failed: {}",
                        setup.request,
                        slot_id,
                        code
                    );
                    return Err(KError::Transfer(code));
                }
                return Ok(());
            }
            self.pump_event();
        }

        self.pending.cancel_control(slot_id);
        log::warn!("xhci: control transfer timeout slot={}", slot_id);
        Err(PortFailure::TransferTimeout.into())
    }

    /// Processes one event while a caller waits; errors belong to other
    /// requests and are only logged.
    fn pump_event(&mut self) {
        if !self.has_pending_event() {
            core::hint::spin_loop();
            return;
        }
        if let Err(e) = self.process_event() {
            log::debug!("xhci: event while waiting: {}", e);
        }
    }

    /// Frees a slot's memory and clears its DCBAA entry.
    pub(super) fn release_slot(&mut self, slot_id: u8) {
        let Some(device) = self.slots.get_mut(slot_id as usize).and_then(Option::take) else {
            return;
        };
        if let Some(memory) = &self.memory {
            memory.dcbaa.write_u64(slot_id as usize * 8, 0);
        }
        device.release(&mut self.pool);
        log::debug!("xhci: released slot={}", slot_id);
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &DmaPool {
        &self.pool
    }
}

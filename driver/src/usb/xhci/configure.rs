//! Port configuration: reset, address and configure the device on a root
//! hub port, then bind its class driver.
//!
//! Driven synchronously; every wait is bounded. A failure at any step leaves
//! no slot, no DMA memory and no binding behind.

use crate::usb::class::ClassKind;
use crate::usb::{
    ConfigDescriptor, DescriptorIter, DescriptorType, DeviceDescriptor, EndpointDescriptor,
    EndpointDirection, EndpointType, InterfaceDescriptor, SetupPacket, UsbSpeed,
};
use crate::usb::class::mouse::{self, BOOT_PROTOCOL};
use crate::util::{KError, KResult, PortFailure};

use super::context::{ep_type, EndpointContext, SlotContext};
use super::controller::Controller;
use super::device::{DeviceSlot, InterruptEndpoint, CONTROL_BUFFER_SIZE};
use super::port::{Port, PortConfigState};
use super::regs::{PortSc, RegisterAccess};
use super::trb::Trb;

/// Interface and endpoint picked from the configuration descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClassMatch {
    pub kind: ClassKind,
    pub interface: u8,
    pub endpoint: EndpointDescriptor,
}

/// Finds the first interface with a class driver and its interrupt-IN
/// endpoint.
pub(crate) fn find_class_interface(descriptors: &[u8]) -> Option<ClassMatch> {
    let mut current: Option<(ClassKind, u8)> = None;
    for (desc_type, raw) in DescriptorIter::new(descriptors) {
        if desc_type == DescriptorType::Interface as u8 {
            current = InterfaceDescriptor::parse(raw)
                .filter(|iface| iface.alternate_setting == 0)
                .and_then(|iface| {
                    ClassKind::resolve(
                        iface.interface_class,
                        iface.interface_subclass,
                        iface.interface_protocol,
                    )
                    .map(|kind| (kind, iface.interface_number))
                });
        } else if desc_type == DescriptorType::Endpoint as u8 {
            let Some((kind, interface)) = current else {
                continue;
            };
            let Some(endpoint) = EndpointDescriptor::parse(raw) else {
                continue;
            };
            if endpoint.direction() == EndpointDirection::In
                && endpoint.transfer_type() == EndpointType::Interrupt
            {
                return Some(ClassMatch {
                    kind,
                    interface,
                    endpoint,
                });
            }
        }
    }
    None
}

/// Endpoint context Interval field (exponent of 125 us units) from
/// bInterval.
pub(crate) fn interrupt_interval(speed: UsbSpeed, b_interval: u8) -> u8 {
    match speed {
        // bInterval in 1 ms frames
        UsbSpeed::Low | UsbSpeed::Full => {
            let microframes = (b_interval.max(1) as u32) * 8;
            (31 - microframes.leading_zeros()).clamp(3, 10) as u8
        }
        // bInterval is already 2^(bInterval-1) microframes
        UsbSpeed::High | UsbSpeed::Super | UsbSpeed::SuperPlus => b_interval.clamp(1, 16) - 1,
    }
}

impl<R: RegisterAccess> Controller<R> {
    /// Drives `port` to `Configured`: reset, Enable Slot, Address Device,
    /// descriptors, Configure Endpoint, SET_PROTOCOL(boot), first
    /// interrupt-IN transfer and class binding.
    pub fn configure_port(&mut self, port: &Port) -> KResult<()> {
        let index = port.index();
        let current = self.port_at(index)?;
        self.memory_mut()?;

        let record = self.ports[index as usize - 1];
        if let Some(slot_id) = record.slot_id {
            if record.state == PortConfigState::Configured
                && current.is_connected()
                && current.is_enabled()
                && !current.has_connect_change()
            {
                return Ok(());
            }
            // The device was removed or replaced and its event is not
            // processed yet.
            log::info!("xhci: port {} releasing stale slot={}", index, slot_id);
            self.ports[index as usize - 1].slot_id = None;
            self.abandon_slot(slot_id);
        }
        if !current.is_connected() {
            self.set_port_state(index, PortConfigState::Disconnected);
            return Err(PortFailure::NotConnected.into());
        }

        let mut enabled_slot = None;
        match self.configure_steps(index, &mut enabled_slot) {
            Ok(slot_id) => {
                let record = &mut self.ports[index as usize - 1];
                record.state = PortConfigState::Configured;
                record.slot_id = Some(slot_id);
                log::info!("xhci: port {} configured slot={}", index, slot_id);
                Ok(())
            }
            Err(e) => {
                log::warn!("xhci: port {} configuration failed: {}", index, e);
                if let Some(slot_id) = enabled_slot {
                    self.abandon_slot(slot_id);
                }
                let record = &mut self.ports[index as usize - 1];
                record.state = PortConfigState::Failed;
                record.slot_id = None;
                Err(e)
            }
        }
    }

    fn set_port_state(&mut self, index: u8, state: PortConfigState) {
        self.ports[index as usize - 1].state = state;
    }

    fn configure_steps(&mut self, index: u8, enabled_slot: &mut Option<u8>) -> KResult<u8> {
        self.set_port_state(index, PortConfigState::Resetting);
        let speed = self.reset_port(index)?;

        self.set_port_state(index, PortConfigState::Addressing);
        let slot_id = self.execute_command(Trb::enable_slot())?.slot_id;
        if slot_id == 0 || slot_id as usize >= self.slots.len() {
            return Err(PortFailure::InvalidSlotId(slot_id).into());
        }
        *enabled_slot = Some(slot_id);
        log::debug!("xhci: port {} slot={} speed={:?}", index, slot_id, speed);

        self.address_device(slot_id, index, speed)?;

        self.set_port_state(index, PortConfigState::Configuring);
        self.read_device_descriptor(slot_id)?;
        let (config_value, found) = self.read_configuration(slot_id)?;
        self.control_transfer(slot_id, SetupPacket::set_configuration(config_value))?;
        self.configure_interrupt_endpoint(slot_id, &found)?;

        self.control_transfer(
            slot_id,
            mouse::set_protocol_packet(found.interface, BOOT_PROTOCOL),
        )?;
        // SET_IDLE is optional for boot devices; a stall is not fatal.
        if let Err(e) = self.control_transfer(slot_id, mouse::set_idle_packet(found.interface, 0)) {
            match e {
                KError::Transfer(_) => log::debug!("xhci: slot={} set_idle: {}", slot_id, e),
                other => return Err(other),
            }
        }

        self.start_interrupt_in(slot_id, found.endpoint.dci())?;
        self.classes.bind(
            slot_id,
            found.endpoint.dci(),
            found.kind,
            self.config.mouse_delta_mode,
        );
        Ok(slot_id)
    }

    /// Port reset; returns the negotiated speed.
    fn reset_port(&mut self, index: u8) -> KResult<UsbSpeed> {
        let portsc = self.regs.portsc(index);
        self.regs.write_portsc(index, portsc.write_base() | PortSc::PR);

        let done = self.wait(self.config.port_reset_poll_limit, |regs| {
            let now = regs.portsc(index);
            !now.contains(PortSc::PR) && now.contains(PortSc::PRC)
        });
        if !done {
            return Err(PortFailure::ResetTimeout.into());
        }

        let portsc = self.regs.portsc(index);
        self.regs
            .write_portsc(index, portsc.write_base() | PortSc::PRC | PortSc::CSC);
        if !portsc.contains(PortSc::CCS) {
            return Err(PortFailure::NotConnected.into());
        }
        if !portsc.contains(PortSc::PED) {
            return Err(PortFailure::ResetTimeout.into());
        }
        UsbSpeed::from_xhci_speed(portsc.speed()).ok_or(PortFailure::UnsupportedDevice.into())
    }

    fn address_device(&mut self, slot_id: u8, port: u8, speed: UsbSpeed) -> KResult<()> {
        let device = DeviceSlot::allocate(&mut self.pool, slot_id, port, speed, self.caps.context_size)
            .ok_or(PortFailure::OutOfDmaMemory)?;

        let input = &device.input;
        input.set_add_flags(0b11);
        input.set_slot(&SlotContext {
            speed: speed.xhci_speed(),
            context_entries: 1,
            root_hub_port: port,
            ..Default::default()
        });
        input.set_endpoint(
            1,
            &EndpointContext {
                ep_type: ep_type::CONTROL,
                error_count: 3,
                max_packet_size: device.max_packet_size0,
                dequeue_pointer: device.ep0.phys() | device.ep0.cycle() as u64,
                average_trb_length: 8,
                ..Default::default()
            },
        );
        let input_phys = input.phys();

        self.memory_mut()?
            .dcbaa
            .write_u64(slot_id as usize * 8, device.output.phys());
        self.slots[slot_id as usize] = Some(device);

        self.execute_command(Trb::address_device(input_phys, slot_id))?;

        if let Some(device) = self.slots[slot_id as usize].as_mut() {
            device.address = device.output.slot().device_address;
            log::debug!("xhci: slot={} address={}", slot_id, device.address);
        }
        Ok(())
    }

    fn device_mut(&mut self, slot_id: u8) -> KResult<&mut DeviceSlot> {
        self.slots
            .get_mut(slot_id as usize)
            .and_then(Option::as_mut)
            .ok_or(KError::PortConfiguration(PortFailure::InvalidSlotId(slot_id)))
    }

    fn read_device_descriptor(&mut self, slot_id: u8) -> KResult<DeviceDescriptor> {
        self.control_transfer(
            slot_id,
            SetupPacket::get_descriptor(DescriptorType::Device, 0, DeviceDescriptor::LENGTH as u16),
        )?;
        let device = self.device_mut(slot_id)?;
        let mut raw = [0u8; DeviceDescriptor::LENGTH];
        device.control_buffer.read_bytes(0, &mut raw);
        let descriptor = DeviceDescriptor::parse(&raw).ok_or(PortFailure::InvalidDescriptor)?;

        let max_packet = descriptor.ep0_max_packet_size();
        if max_packet == 0 {
            return Err(PortFailure::InvalidDescriptor.into());
        }
        log::debug!(
            "xhci: slot={} vid={:04x} pid={:04x} mps0={}",
            slot_id,
            descriptor.vendor_id,
            descriptor.product_id,
            max_packet
        );

        if device.speed == UsbSpeed::Full && max_packet != device.max_packet_size0 {
            device.max_packet_size0 = max_packet;
            let input = &device.input;
            let mut ep0 = device.output.endpoint(1);
            ep0.max_packet_size = max_packet;
            ep0.state = 0;
            input.reset();
            input.set_add_flags(1 << 1);
            input.set_endpoint(1, &ep0);
            let input_phys = input.phys();
            self.execute_command(Trb::evaluate_context(input_phys, slot_id))?;
        }
        Ok(descriptor)
    }

    /// Reads the configuration descriptor set and picks the interface to
    /// drive. Returns the configuration value with it.
    fn read_configuration(&mut self, slot_id: u8) -> KResult<(u8, ClassMatch)> {
        self.control_transfer(
            slot_id,
            SetupPacket::get_descriptor(DescriptorType::Configuration, 0, ConfigDescriptor::LENGTH as u16),
        )?;
        let mut header = [0u8; ConfigDescriptor::LENGTH];
        self.device_mut(slot_id)?.control_buffer.read_bytes(0, &mut header);
        let config = ConfigDescriptor::parse(&header).ok_or(PortFailure::InvalidDescriptor)?;
        if (config.total_length as usize) < ConfigDescriptor::LENGTH {
            return Err(PortFailure::InvalidDescriptor.into());
        }

        let total = (config.total_length as usize).min(CONTROL_BUFFER_SIZE);
        self.control_transfer(
            slot_id,
            SetupPacket::get_descriptor(DescriptorType::Configuration, 0, total as u16),
        )?;
        let mut raw = [0u8; CONTROL_BUFFER_SIZE];
        self.device_mut(slot_id)?.control_buffer.read_bytes(0, &mut raw[..total]);

        let found = find_class_interface(&raw[..total]).ok_or(PortFailure::UnsupportedDevice)?;
        log::debug!(
            "xhci: slot={} config={} interface={} ep={:#x} mps={} interval={}",
            slot_id,
            config.configuration_value,
            found.interface,
            found.endpoint.endpoint_address,
            found.endpoint.packet_size(),
            found.endpoint.interval
        );
        Ok((config.configuration_value, found))
    }

    fn configure_interrupt_endpoint(&mut self, slot_id: u8, found: &ClassMatch) -> KResult<()> {
        let dci = found.endpoint.dci();
        let max_packet = found.endpoint.packet_size();
        self.device_mut(slot_id)?;
        let endpoint = InterruptEndpoint::allocate(&mut self.pool, dci, max_packet)
            .ok_or(PortFailure::OutOfDmaMemory)?;

        let device = self.device_mut(slot_id)?;
        let interval = interrupt_interval(device.speed, found.endpoint.interval);
        let input = &device.input;
        input.reset();
        input.set_add_flags(1 | (1 << dci));
        let mut slot = device.output.slot();
        slot.context_entries = slot.context_entries.max(dci);
        slot.slot_state = 0;
        slot.device_address = 0;
        input.set_slot(&slot);
        input.set_endpoint(
            dci,
            &EndpointContext {
                ep_type: ep_type::INTERRUPT_IN,
                interval,
                error_count: 3,
                max_packet_size: max_packet,
                dequeue_pointer: endpoint.ring.phys() | endpoint.ring.cycle() as u64,
                average_trb_length: max_packet,
                max_esit_payload: max_packet as u32,
                ..Default::default()
            },
        );
        let input_phys = input.phys();
        device.interrupt_in = Some(endpoint);

        self.execute_command(Trb::configure_endpoint(input_phys, slot_id))?;
        Ok(())
    }

    /// Queues one Normal TRB on the interrupt-IN ring and rings its doorbell.
    pub(super) fn start_interrupt_in(&mut self, slot_id: u8, dci: u8) -> KResult<()> {
        let endpoint = self
            .device_mut(slot_id)?
            .interrupt_endpoint_mut(dci)
            .ok_or(PortFailure::UnsupportedDevice)?;
        let trb = Trb::normal(endpoint.buffer.phys().as_u64(), endpoint.transfer_size);
        endpoint.ring.push(trb)?;
        self.regs.ring_doorbell(slot_id, dci);
        Ok(())
    }

    /// Undoes a partially configured slot: Disable Slot (best effort), then
    /// return its memory and clear the DCBAA entry.
    fn abandon_slot(&mut self, slot_id: u8) {
        self.classes.unbind_slot(slot_id);
        self.pending.forget_slot(slot_id);
        if let Err(e) = self.execute_command(Trb::disable_slot(slot_id)) {
            log::warn!("xhci: disable slot={} failed: {}", slot_id, e);
        }
        self.release_slot(slot_id);
    }
}

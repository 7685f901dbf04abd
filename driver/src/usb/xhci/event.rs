//! Event ring consumption.

use crate::util::{KError, KResult};

use super::controller::Controller;
use super::device::REPORT_BUFFER_SIZE;
use super::pending::{CommandKind, CommandResult};
use super::port::PortConfigState;
use super::regs::{Iman, PortSc, RegisterAccess, UsbSts, ERDP_EHB};
use super::trb::{Trb, TrbType};

impl<R: RegisterAccess> Controller<R> {
    /// Consumes at most one event from the primary event ring.
    ///
    /// The dequeue pointer is always advanced before the event is handled,
    /// so an error never stalls the ring. With no pending event this is a
    /// no-op.
    pub fn process_event(&mut self) -> KResult<()> {
        let Some(memory) = self.memory.as_mut() else {
            return Ok(());
        };
        let Some(event) = memory.event_ring.pop() else {
            return Ok(());
        };
        let erdp = memory.event_ring.dequeue_pointer();
        self.regs.set_erdp(erdp | ERDP_EHB);
        let iman = self.regs.iman();
        self.regs.set_iman(iman | Iman::IP);
        self.regs.ack_usbsts(UsbSts::EINT);

        match TrbType::from_raw(event.trb_type()) {
            Some(TrbType::PortStatusChange) => self.on_port_status_change(event.port_id()),
            Some(TrbType::CommandCompletion) => self.on_command_completion(&event),
            Some(TrbType::TransferEvent) => self.on_transfer(&event),
            Some(TrbType::HostController) => {
                let code = event.completion_code();
                if code.is_success() {
                    Ok(())
                } else {
                    log::warn!("xhci: host controller event: {}", code);
                    Err(KError::Command(code))
                }
            }
            other => {
                log::debug!("xhci: ignoring event type={:?} raw={}", other, event.trb_type());
                Ok(())
            }
        }
    }

    fn on_port_status_change(&mut self, port_id: u8) -> KResult<()> {
        if self.check_port(port_id).is_err() {
            log::warn!("xhci: port status change for unknown port {}", port_id);
            return Ok(());
        }

        let portsc = self.regs.portsc(port_id);
        let changes = portsc & PortSc::CHANGE_BITS;
        if !changes.is_empty() {
            self.regs.write_portsc(port_id, portsc.write_base() | changes);
        }
        log::debug!(
            "xhci: port {} status change connected={} changes={:?}",
            port_id,
            portsc.contains(PortSc::CCS),
            changes
        );

        // A connect change on a port that owns a slot means the device
        // behind that slot is gone, even if another one is plugged in now.
        let connected = portsc.contains(PortSc::CCS);
        let record = &mut self.ports[port_id as usize - 1];
        let replaced = changes.contains(PortSc::CSC) && record.slot_id.is_some();
        if connected && !replaced {
            return Ok(());
        }

        record.state = PortConfigState::Disconnected;
        let Some(slot_id) = record.slot_id.take() else {
            return Ok(());
        };

        let unbound = self.classes.unbind_slot(slot_id);
        self.pending.forget_slot(slot_id);
        log::info!(
            "xhci: port {} {} slot={} unbound={}",
            port_id,
            if connected { "replaced" } else { "disconnected" },
            slot_id,
            unbound
        );

        if let Err(e) = self.queue_disable_slot(slot_id) {
            log::warn!("xhci: cannot queue disable slot={}: {}", slot_id, e);
            self.release_slot(slot_id);
            return Err(e);
        }
        Ok(())
    }

    fn on_command_completion(&mut self, event: &Trb) -> KResult<()> {
        let addr = event.pointer();
        let result = CommandResult {
            code: event.completion_code(),
            slot_id: event.slot_id(),
        };
        if let Some(memory) = self.memory.as_mut() {
            memory.command_ring.retire(addr);
        }

        match self.pending.complete_command(addr, result) {
            Some(CommandKind::DisableSlot { slot_id }) => self.release_slot(slot_id),
            Some(CommandKind::Awaited) => {}
            None => log::debug!("xhci: dropping completion for unknown command {:#x}", addr),
        }

        if !result.code.is_success() {
            log::warn!("xhci: command {:#x} failed: {}", addr, result.code);
            return Err(KError::Command(result.code));
        }
        Ok(())
    }

    fn on_transfer(&mut self, event: &Trb) -> KResult<()> {
        let slot_id = event.slot_id();
        let dci = event.endpoint_id();
        let code = event.completion_code();

        if dci == 1 && self.pending.complete_control(slot_id, event.pointer(), code) {
            return Ok(());
        }
        if !self.classes.is_bound(slot_id, dci) {
            log::trace!("xhci: dropping transfer event slot={} dci={} code={}", slot_id, dci, code);
            return Ok(());
        }
        let Some(endpoint) = self
            .slots
            .get_mut(slot_id as usize)
            .and_then(Option::as_mut)
            .and_then(|device| device.interrupt_endpoint_mut(dci))
        else {
            return Ok(());
        };
        endpoint.ring.mark_consumed(event.pointer());

        if !code.is_transfer_ok() {
            log::warn!("xhci: transfer slot={} dci={} failed: {}", slot_id, dci, code);
            return Err(KError::Transfer(code));
        }

        let received = endpoint.transfer_size.saturating_sub(event.transfer_length()) as usize;
        let mut report = [0u8; REPORT_BUFFER_SIZE];
        let report = &mut report[..received.min(REPORT_BUFFER_SIZE)];
        endpoint.buffer.read_bytes(0, report);

        let requeue = Trb::normal(endpoint.buffer.phys().as_u64(), endpoint.transfer_size);
        endpoint.ring.push(requeue)?;
        self.regs.ring_doorbell(slot_id, dci);

        self.classes.dispatch(slot_id, dci, report);
        Ok(())
    }
}

//! Per-device state: contexts, transfer rings and buffers of one slot.

use crate::dma::{DmaBuffer, DmaPool};
use crate::usb::UsbSpeed;

use super::context::{DeviceContext, InputContext};
use super::ring::{ProducerRing, TRANSFER_RING_SIZE};

/// Buffer used for EP0 data stages (descriptors).
pub const CONTROL_BUFFER_SIZE: usize = 512;

/// Largest interrupt transfer queued per Normal TRB.
pub const REPORT_BUFFER_SIZE: usize = 64;

/// An interrupt-IN endpoint with its own ring and report buffer.
pub struct InterruptEndpoint {
    pub dci: u8,
    pub ring: ProducerRing,
    pub buffer: DmaBuffer,
    /// Bytes requested by each Normal TRB.
    pub transfer_size: u32,
}

impl InterruptEndpoint {
    pub fn allocate(pool: &mut DmaPool, dci: u8, max_packet: u16) -> Option<Self> {
        let transfer_size = (max_packet as usize).clamp(1, REPORT_BUFFER_SIZE);
        let ring = ProducerRing::new(pool, TRANSFER_RING_SIZE)?;
        let Some(buffer) = pool.allocate(transfer_size, 64) else {
            ring.release(pool);
            return None;
        };
        Some(Self {
            dci,
            ring,
            buffer,
            transfer_size: transfer_size as u32,
        })
    }

    pub fn release(self, pool: &mut DmaPool) {
        self.ring.release(pool);
        pool.free(self.buffer);
    }
}

/// Device Slot
pub struct DeviceSlot {
    pub slot_id: u8,
    pub port: u8,
    pub speed: UsbSpeed,
    /// USB address assigned by Address Device.
    pub address: u8,
    pub max_packet_size0: u16,
    pub input: InputContext,
    pub output: DeviceContext,
    pub ep0: ProducerRing,
    pub control_buffer: DmaBuffer,
    pub interrupt_in: Option<InterruptEndpoint>,
}

impl DeviceSlot {
    pub fn allocate(
        pool: &mut DmaPool,
        slot_id: u8,
        port: u8,
        speed: UsbSpeed,
        ctx_size: usize,
    ) -> Option<Self> {
        let input = InputContext::new(pool, ctx_size)?;
        let Some(output) = DeviceContext::new(pool, ctx_size) else {
            input.release(pool);
            return None;
        };
        let Some(ep0) = ProducerRing::new(pool, TRANSFER_RING_SIZE) else {
            input.release(pool);
            output.release(pool);
            return None;
        };
        let Some(control_buffer) = pool.allocate(CONTROL_BUFFER_SIZE, 64) else {
            input.release(pool);
            output.release(pool);
            ep0.release(pool);
            return None;
        };
        Some(Self {
            slot_id,
            port,
            speed,
            address: 0,
            max_packet_size0: speed.default_max_packet_size(),
            input,
            output,
            ep0,
            control_buffer,
            interrupt_in: None,
        })
    }

    pub fn interrupt_endpoint_mut(&mut self, dci: u8) -> Option<&mut InterruptEndpoint> {
        self.interrupt_in.as_mut().filter(|ep| ep.dci == dci)
    }

    pub fn release(self, pool: &mut DmaPool) {
        self.input.release(pool);
        self.output.release(pool);
        self.ep0.release(pool);
        pool.free(self.control_buffer);
        if let Some(ep) = self.interrupt_in {
            ep.release(pool);
        }
    }
}

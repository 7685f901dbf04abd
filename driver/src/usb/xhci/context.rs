//! Slot, endpoint, input and device contexts.
//!
//! Context structures are 32 or 64 bytes (HCCPARAMS1.CSZ); only the first
//! 32 bytes carry fields. The typed views below are packed into and out of
//! the DMA buffers dword by dword.

use crate::dma::{DmaBuffer, DmaPool};

/// Endpoint Type field of the endpoint context.
pub mod ep_type {
    pub const ISOCH_OUT: u8 = 1;
    pub const BULK_OUT: u8 = 2;
    pub const INTERRUPT_OUT: u8 = 3;
    pub const CONTROL: u8 = 4;
    pub const ISOCH_IN: u8 = 5;
    pub const BULK_IN: u8 = 6;
    pub const INTERRUPT_IN: u8 = 7;
}

/// Slot Context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotContext {
    pub route_string: u32,
    pub speed: u8,
    /// Index of the last valid endpoint context.
    pub context_entries: u8,
    pub root_hub_port: u8,
    pub interrupter_target: u16,
    pub device_address: u8,
    pub slot_state: u8,
}

impl SlotContext {
    pub fn to_dwords(&self) -> [u32; 4] {
        [
            (self.route_string & 0xF_FFFF)
                | ((self.speed as u32 & 0xF) << 20)
                | ((self.context_entries as u32 & 0x1F) << 27),
            (self.root_hub_port as u32) << 16,
            (self.interrupter_target as u32 & 0x3FF) << 22,
            (self.device_address as u32) | ((self.slot_state as u32 & 0x1F) << 27),
        ]
    }

    pub fn from_dwords(dw: [u32; 4]) -> Self {
        Self {
            route_string: dw[0] & 0xF_FFFF,
            speed: ((dw[0] >> 20) & 0xF) as u8,
            context_entries: (dw[0] >> 27) as u8,
            root_hub_port: ((dw[1] >> 16) & 0xFF) as u8,
            interrupter_target: (dw[2] >> 22) as u16,
            device_address: (dw[3] & 0xFF) as u8,
            slot_state: (dw[3] >> 27) as u8,
        }
    }
}

/// Endpoint Context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointContext {
    pub state: u8,
    pub interval: u8,
    /// CErr
    pub error_count: u8,
    pub ep_type: u8,
    pub max_burst: u8,
    pub max_packet_size: u16,
    /// TR dequeue pointer with the dequeue cycle state in bit 0.
    pub dequeue_pointer: u64,
    pub average_trb_length: u16,
    pub max_esit_payload: u32,
}

impl EndpointContext {
    pub fn to_dwords(&self) -> [u32; 5] {
        [
            (self.state as u32 & 0x7)
                | ((self.interval as u32) << 16)
                | (((self.max_esit_payload >> 16) & 0xFF) << 24),
            ((self.error_count as u32 & 0x3) << 1)
                | ((self.ep_type as u32 & 0x7) << 3)
                | ((self.max_burst as u32) << 8)
                | ((self.max_packet_size as u32) << 16),
            self.dequeue_pointer as u32,
            (self.dequeue_pointer >> 32) as u32,
            (self.average_trb_length as u32) | ((self.max_esit_payload & 0xFFFF) << 16),
        ]
    }

    pub fn from_dwords(dw: [u32; 5]) -> Self {
        Self {
            state: (dw[0] & 0x7) as u8,
            interval: ((dw[0] >> 16) & 0xFF) as u8,
            error_count: ((dw[1] >> 1) & 0x3) as u8,
            ep_type: ((dw[1] >> 3) & 0x7) as u8,
            max_burst: ((dw[1] >> 8) & 0xFF) as u8,
            max_packet_size: (dw[1] >> 16) as u16,
            dequeue_pointer: (dw[2] as u64) | ((dw[3] as u64) << 32),
            average_trb_length: (dw[4] & 0xFFFF) as u16,
            max_esit_payload: ((dw[0] >> 24) << 16) | (dw[4] >> 16),
        }
    }
}

fn write_dwords(buf: &DmaBuffer, offset: usize, dwords: &[u32]) {
    for (i, dw) in dwords.iter().enumerate() {
        buf.write_u32(offset + i * 4, *dw);
    }
}

fn read_dwords<const N: usize>(buf: &DmaBuffer, offset: usize) -> [u32; N] {
    let mut dwords = [0u32; N];
    for (i, dw) in dwords.iter_mut().enumerate() {
        *dw = buf.read_u32(offset + i * 4);
    }
    dwords
}

/// Input Context (Control + Slot + 31 Endpoints)
pub struct InputContext {
    buf: DmaBuffer,
    ctx_size: usize,
}

impl InputContext {
    pub fn new(pool: &mut DmaPool, ctx_size: usize) -> Option<Self> {
        let buf = pool.allocate(33 * ctx_size, 64)?;
        Some(Self { buf, ctx_size })
    }

    pub fn phys(&self) -> u64 {
        self.buf.phys().as_u64()
    }

    /// Clears the whole input context before a new command.
    pub fn reset(&self) {
        self.buf.zero();
    }

    /// Input control context: drop nothing, add the contexts in `flags`
    /// (bit 0 = slot, bit n = DCI n).
    pub fn set_add_flags(&self, flags: u32) {
        self.buf.write_u32(0, 0);
        self.buf.write_u32(4, flags);
    }

    pub fn add_flags(&self) -> u32 {
        self.buf.read_u32(4)
    }

    pub fn set_slot(&self, slot: &SlotContext) {
        write_dwords(&self.buf, self.ctx_size, &slot.to_dwords());
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext::from_dwords(read_dwords(&self.buf, self.ctx_size))
    }

    pub fn set_endpoint(&self, dci: u8, ep: &EndpointContext) {
        write_dwords(&self.buf, (dci as usize + 1) * self.ctx_size, &ep.to_dwords());
    }

    pub fn endpoint(&self, dci: u8) -> EndpointContext {
        EndpointContext::from_dwords(read_dwords(&self.buf, (dci as usize + 1) * self.ctx_size))
    }

    pub fn release(self, pool: &mut DmaPool) {
        pool.free(self.buf);
    }
}

/// Device Context (Slot + 31 Endpoints), written by the controller.
pub struct DeviceContext {
    buf: DmaBuffer,
    ctx_size: usize,
}

impl DeviceContext {
    pub fn new(pool: &mut DmaPool, ctx_size: usize) -> Option<Self> {
        let buf = pool.allocate(32 * ctx_size, 64)?;
        Some(Self { buf, ctx_size })
    }

    pub fn phys(&self) -> u64 {
        self.buf.phys().as_u64()
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext::from_dwords(read_dwords(&self.buf, 0))
    }

    pub fn endpoint(&self, dci: u8) -> EndpointContext {
        EndpointContext::from_dwords(read_dwords(&self.buf, dci as usize * self.ctx_size))
    }

    pub fn release(self, pool: &mut DmaPool) {
        pool.free(self.buf);
    }
}

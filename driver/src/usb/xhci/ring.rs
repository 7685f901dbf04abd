//! Producer rings (command and transfer rings).
//!
//! The last TRB of the segment is a Link TRB with Toggle Cycle pointing back
//! at the first one. A TRB belongs to the controller once its cycle bit
//! matches the producer cycle state.

use core::sync::atomic::{fence, Ordering};

use crate::dma::{DmaBuffer, DmaPool};
use crate::util::{KError, KResult};

use super::trb::{Trb, TRB_SIZE};

/// TRBs per transfer ring, Link TRB included.
pub const TRANSFER_RING_SIZE: usize = 32;

pub struct ProducerRing {
    buf: DmaBuffer,
    size: usize,
    enqueue: usize,
    /// First TRB not yet known to be consumed by the controller.
    dequeue: usize,
    cycle: bool,
}

impl ProducerRing {
    pub fn new(pool: &mut DmaPool, size: usize) -> Option<Self> {
        debug_assert!(size >= 3);
        let buf = pool.allocate(size * TRB_SIZE, 64)?;
        let ring = Self {
            buf,
            size,
            enqueue: 0,
            dequeue: 0,
            cycle: true,
        };
        // Cycle bit clear: the controller stops here until we wrap.
        ring.write_trb(size - 1, &Trb::link(buf.phys().as_u64()));
        Some(ring)
    }

    /// Physical address of the first TRB.
    pub fn phys(&self) -> u64 {
        self.buf.phys().as_u64()
    }

    /// Producer cycle state.
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.buf.contains_phys(addr)
    }

    /// Free TRB slots (one is kept empty to tell full from empty).
    pub fn available(&self) -> usize {
        let usable = self.size - 1;
        let used = (self.enqueue + usable - self.dequeue) % usable;
        usable - 1 - used
    }

    pub fn is_full(&self) -> bool {
        self.available() == 0
    }

    /// Queues one TRB with the current cycle bit and returns its physical
    /// address. Crossing the Link TRB hands it to the controller and toggles
    /// the producer cycle state.
    pub fn push(&mut self, trb: Trb) -> KResult<u64> {
        if self.is_full() {
            return Err(KError::RingFull);
        }

        let index = self.enqueue;
        let mut trb = trb;
        trb.set_cycle(self.cycle);
        self.write_trb(index, &trb);
        let addr = self.buf.phys_at(index * TRB_SIZE);

        self.enqueue += 1;
        if self.enqueue == self.size - 1 {
            let mut link = Trb::link(self.phys());
            link.set_cycle(self.cycle);
            self.write_trb(self.size - 1, &link);
            self.enqueue = 0;
            self.cycle = !self.cycle;
        }

        Ok(addr)
    }

    /// The controller reported completion of the TRB at `addr`; everything
    /// up to and including it may be reused.
    pub fn mark_consumed(&mut self, addr: u64) {
        if !self.contains(addr) {
            return;
        }
        let index = ((addr - self.phys()) as usize) / TRB_SIZE;
        if index < self.size - 1 {
            self.dequeue = (index + 1) % (self.size - 1);
        }
    }

    pub fn read_trb(&self, index: usize) -> Trb {
        let offset = index * TRB_SIZE;
        Trb {
            param_lo: self.buf.read_u32(offset),
            param_hi: self.buf.read_u32(offset + 4),
            status: self.buf.read_u32(offset + 8),
            control: self.buf.read_u32(offset + 12),
        }
    }

    fn write_trb(&self, index: usize, trb: &Trb) {
        let offset = index * TRB_SIZE;
        self.buf.write_u32(offset, trb.param_lo);
        self.buf.write_u32(offset + 4, trb.param_hi);
        self.buf.write_u32(offset + 8, trb.status);
        // The cycle bit goes last so the controller never sees a half-written TRB.
        fence(Ordering::Release);
        self.buf.write_u32(offset + 12, trb.control);
    }

    pub fn release(self, pool: &mut DmaPool) {
        pool.free(self.buf);
    }
}

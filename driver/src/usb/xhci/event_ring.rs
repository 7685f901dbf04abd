//! Primary event ring: one segment described by a one-entry ERST.

use core::sync::atomic::{fence, Ordering};

use crate::dma::{DmaBuffer, DmaPool};

use super::trb::{Trb, TRB_SIZE};

pub const EVENT_RING_SIZE: usize = 64;

/// Event Ring Segment Table Entry
const ERST_ENTRY_SIZE: usize = 16;

pub struct EventRing {
    segment: DmaBuffer,
    erst: DmaBuffer,
    size: usize,
    dequeue: usize,
    cycle: bool,
}

impl EventRing {
    pub fn new(pool: &mut DmaPool, size: usize) -> Option<Self> {
        let segment = pool.allocate(size * TRB_SIZE, 64)?;
        let Some(erst) = pool.allocate(ERST_ENTRY_SIZE, 64) else {
            pool.free(segment);
            return None;
        };
        erst.write_u64(0, segment.phys().as_u64());
        erst.write_u32(8, size as u32);
        Some(Self {
            segment,
            erst,
            size,
            dequeue: 0,
            cycle: true,
        })
    }

    /// Physical address of the segment table (ERSTBA).
    pub fn erst_phys(&self) -> u64 {
        self.erst.phys().as_u64()
    }

    /// Number of ERST entries (ERSTSZ).
    pub fn segment_count(&self) -> u16 {
        1
    }

    /// Physical address of the next entry to consume (ERDP).
    pub fn dequeue_pointer(&self) -> u64 {
        self.segment.phys_at(self.dequeue * TRB_SIZE)
    }

    pub fn expected_cycle(&self) -> bool {
        self.cycle
    }

    /// True iff the entry under the cursor has been written by the
    /// controller in the current pass.
    pub fn has_front(&self) -> bool {
        let control = self.segment.read_u32(self.dequeue * TRB_SIZE + 12);
        (control & 1 != 0) == self.cycle
    }

    /// Consumes the entry under the cursor, if present.
    pub fn pop(&mut self) -> Option<Trb> {
        if !self.has_front() {
            return None;
        }
        let offset = self.dequeue * TRB_SIZE;
        let control = self.segment.read_u32(offset + 12);
        // Cycle bit observed before the payload.
        fence(Ordering::Acquire);
        let trb = Trb {
            param_lo: self.segment.read_u32(offset),
            param_hi: self.segment.read_u32(offset + 4),
            status: self.segment.read_u32(offset + 8),
            control,
        };

        self.dequeue += 1;
        if self.dequeue == self.size {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }

    pub fn release(self, pool: &mut DmaPool) {
        pool.free(self.segment);
        pool.free(self.erst);
    }
}

//! Command ring.

use crate::dma::DmaPool;
use crate::util::KResult;

use super::ring::ProducerRing;
use super::trb::Trb;

pub const COMMAND_RING_SIZE: usize = 32;

/// Ring Cycle State bit of CRCR.
const CRCR_RCS: u64 = 1 << 0;

pub struct CommandRing {
    ring: ProducerRing,
}

impl CommandRing {
    pub fn new(pool: &mut DmaPool) -> Option<Self> {
        ProducerRing::new(pool, COMMAND_RING_SIZE).map(|ring| Self { ring })
    }

    /// CRCR value: ring base with RCS = 1.
    pub fn crcr_value(&self) -> u64 {
        self.ring.phys() | CRCR_RCS
    }

    /// Queues a command; the caller rings doorbell 0. Returns the command
    /// TRB address, which completion events echo back.
    pub fn push(&mut self, trb: Trb) -> KResult<u64> {
        self.ring.push(trb)
    }

    /// A completion event for the command at `addr` arrived.
    pub fn retire(&mut self, addr: u64) {
        self.ring.mark_consumed(addr);
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.ring.contains(addr)
    }

    pub fn release(self, pool: &mut DmaPool) {
        self.ring.release(pool);
    }
}

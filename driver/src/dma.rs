//! DMA arena for structures the controller reads and writes by physical
//! address.
//!
//! The controller keeps raw physical pointers into rings and contexts for as
//! long as they are in use, so nothing handed out here ever moves. A
//! [`DmaPool`] wraps a fixed region with a first-fit heap and hands out
//! [`DmaBuffer`] handles (virtual pointer, physical address, layout).

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};

use linked_list_allocator::Heap;
use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: usize = 4096;

/// A DMA-visible allocation. Copyable handle; freed explicitly through
/// [`DmaPool::free`].
#[derive(Debug, Clone, Copy)]
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: PhysAddr,
    layout: Layout,
}

impl DmaBuffer {
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn virt(&self) -> VirtAddr {
        VirtAddr::new(self.virt.as_ptr() as u64)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Physical address of the byte at `offset`.
    pub fn phys_at(&self, offset: usize) -> u64 {
        self.phys.as_u64() + offset as u64
    }

    pub fn contains_phys(&self, addr: u64) -> bool {
        let start = self.phys.as_u64();
        addr >= start && addr < start + self.len() as u64
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len());
        // SAFETY: in bounds of a live allocation; 4-byte aligned by construction of callers.
        unsafe { ptr::read_volatile(self.virt.as_ptr().add(offset) as *const u32) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len());
        // SAFETY: see read_u32.
        unsafe { ptr::write_volatile(self.virt.as_ptr().add(offset) as *mut u32, value) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        (self.read_u32(offset) as u64) | ((self.read_u32(offset + 4) as u64) << 32)
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len());
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: in bounds, checked above.
            *byte = unsafe { ptr::read_volatile(self.virt.as_ptr().add(offset + i)) };
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len());
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: in bounds, checked above.
            unsafe { ptr::write_volatile(self.virt.as_ptr().add(offset + i), *byte) };
        }
    }

    pub fn zero(&self) {
        // SAFETY: the whole allocation belongs to this handle.
        unsafe { ptr::write_bytes(self.virt.as_ptr(), 0, self.len()) }
    }
}

/// Fixed DMA region managed by a first-fit heap.
pub struct DmaPool {
    heap: Heap,
    virt_base: u64,
    phys_base: u64,
    size: usize,
}

impl DmaPool {
    /// A pool with no memory; every allocation fails.
    pub const fn empty() -> Self {
        Self {
            heap: Heap::empty(),
            virt_base: 0,
            phys_base: 0,
            size: 0,
        }
    }

    /// # Safety
    /// `virt..virt+size` must be valid, exclusively owned memory for the
    /// lifetime of the pool, mapped so that `virt + n` is reachable by the
    /// controller at `phys + n`.
    pub unsafe fn new(virt: *mut u8, phys: PhysAddr, size: usize) -> Self {
        let mut heap = Heap::empty();
        unsafe { heap.init(virt, size) };
        Self {
            heap,
            virt_base: virt as u64,
            phys_base: phys.as_u64(),
            size,
        }
    }

    /// Pool over identity-mapped memory (physical == virtual).
    ///
    /// # Safety
    /// Same contract as [`DmaPool::new`].
    pub unsafe fn identity(virt: *mut u8, size: usize) -> Self {
        unsafe { Self::new(virt, PhysAddr::new(virt as u64), size) }
    }

    /// Allocates a zeroed buffer.
    ///
    /// The alignment is raised to the next power of two of `size` (capped at
    /// a page) so that no structure straddles a 64 KiB boundary.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<DmaBuffer> {
        let align = align.max(size.next_power_of_two().min(PAGE_SIZE));
        let layout = Layout::from_size_align(size, align).ok()?;
        let virt = self.heap.allocate_first_fit(layout).ok()?;
        let offset = virt.as_ptr() as u64 - self.virt_base;
        let buffer = DmaBuffer {
            virt,
            phys: PhysAddr::new(self.phys_base + offset),
            layout,
        };
        buffer.zero();
        Some(buffer)
    }

    pub fn free(&mut self, buffer: DmaBuffer) {
        // SAFETY: `buffer` was handed out by this heap with this layout.
        unsafe { self.heap.deallocate(buffer.virt, buffer.layout) }
    }

    pub fn free_bytes(&self) -> usize {
        self.heap.free()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// First physical address past the region.
    pub fn phys_end(&self) -> u64 {
        self.phys_base + self.size as u64
    }
}

const STATIC_POOL_SIZE: usize = 256 * 1024;

#[repr(C, align(4096))]
struct StaticArena(UnsafeCell<[u8; STATIC_POOL_SIZE]>);

// SAFETY: handed out at most once through STATIC_POOL_TAKEN.
unsafe impl Sync for StaticArena {}

static STATIC_ARENA: StaticArena = StaticArena(UnsafeCell::new([0; STATIC_POOL_SIZE]));
static STATIC_POOL_TAKEN: AtomicBool = AtomicBool::new(false);

/// Takes the built-in arena used by [`crate::Controller::new`].
///
/// The arena lives in the driver image and is assumed identity mapped.
/// Returns `None` once it has been taken.
pub fn take_static_pool() -> Option<DmaPool> {
    if STATIC_POOL_TAKEN.swap(true, Ordering::SeqCst) {
        return None;
    }
    // SAFETY: the arena is exclusively ours after the swap above.
    Some(unsafe { DmaPool::identity(STATIC_ARENA.0.get() as *mut u8, STATIC_POOL_SIZE) })
}

#[cfg(test)]
pub(crate) fn test_pool(size: usize) -> DmaPool {
    let memory = test_memory(size);
    unsafe { DmaPool::identity(memory, size) }
}

/// Pool whose physical addresses start at `phys` instead of the host
/// address. Only for tests that never let the simulator touch the memory.
#[cfg(test)]
pub(crate) fn test_pool_at(phys: u64, size: usize) -> DmaPool {
    let memory = test_memory(size);
    unsafe { DmaPool::new(memory, PhysAddr::new(phys), size) }
}

#[cfg(test)]
fn test_memory(size: usize) -> *mut u8 {
    let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
    let memory = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!memory.is_null());
    // Leaked on purpose: rings must outlive every simulated access.
    memory
}

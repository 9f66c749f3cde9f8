use crate::error::{FifoError, FifoResult};
use std::fmt;
use std::io;
use std::ptr;

const PAGE_SIZE: usize = 4096;

/// A physically contiguous, CPU-mapped memory region.
///
/// The region is owned by whoever allocated it and must be returned through the same
/// [`PhysMemory`] that produced it.
#[derive(Debug)]
pub struct DmaBuffer {
    ptr: *mut u8,
    size: usize,
    phys: u64,
}

// The CPU mapping is only touched through `&mut self` writes or plain reads.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Wraps an existing mapping.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes, 4-byte aligned, and stay
    /// mapped until the buffer is handed back to its allocator.
    #[must_use]
    pub const unsafe fn from_raw(ptr: *mut u8, size: usize, phys: u64) -> Self {
        Self { ptr, size, phys }
    }

    #[must_use]
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Number of 32-bit words the region holds.
    #[must_use]
    pub const fn words(&self) -> usize {
        self.size / 4
    }

    /// # Panics
    /// Panics if `index` is past the end of the region.
    pub fn write_u32(&mut self, index: usize, value: u32) {
        assert!(index < self.words(), "DMA write past end of buffer");
        // Safety: bounds checked above; the mapping is valid and aligned per `from_raw`.
        unsafe {
            ptr::write_volatile(self.ptr.cast::<u32>().add(index), value);
        }
    }

    /// # Panics
    /// Panics if `index` is past the end of the region.
    #[must_use]
    pub fn read_u32(&self, index: usize) -> u32 {
        assert!(index < self.words(), "DMA read past end of buffer");
        // Safety: bounds checked above; the mapping is valid and aligned per `from_raw`.
        unsafe { ptr::read_volatile(self.ptr.cast::<u32>().add(index)) }
    }
}

/// Allocator for memory the device reads by physical address (runlists, instance blocks).
pub trait PhysMemory: Send + Sync + fmt::Debug {
    /// Allocate a zeroed, contiguous region of at least `size` bytes.
    fn alloc(&self, size: usize) -> FifoResult<DmaBuffer>;

    /// Return a region obtained from [`Self::alloc`].
    fn free(&self, buf: DmaBuffer);
}

/// Host-memory backend: anonymous page-aligned mappings whose CPU address doubles as
/// the "physical" address. Used with simulated register spaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMemory;

impl PhysMemory for HostMemory {
    fn alloc(&self, size: usize) -> FifoResult<DmaBuffer> {
        let size = size.max(1).next_multiple_of(PAGE_SIZE);

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            log::error!("host memory: mmap of {size} bytes failed: {err}");
            return Err(FifoError::Io(err));
        }

        let ptr = ret.cast::<u8>();
        // Safety: a fresh anonymous mapping of `size` bytes, page aligned and zero filled.
        Ok(unsafe { DmaBuffer::from_raw(ptr, size, ptr as u64) })
    }

    fn free(&self, buf: DmaBuffer) {
        let ret = unsafe { libc::munmap(buf.ptr.cast(), buf.size) };
        if ret != 0 {
            log::warn!(
                "host memory: munmap of 0x{:x} failed: {}",
                buf.phys,
                io::Error::last_os_error()
            );
        }
    }
}

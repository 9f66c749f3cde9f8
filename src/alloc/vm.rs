use super::{
    AllocatorFlags, AllocatorOptions, AllocatorStats, BuddyAllocator, PageSizeClass,
    RangeAllocator,
};
use crate::error::{FifoError, FifoResult};
use crate::utils::{align_up, is_aligned};

/// Page-directory entries cover this many big pages.
const BIG_PAGES_PER_PDE: u64 = 1024;

/// Flags controlling where a VA reservation lands.
#[derive(Debug, Clone, Copy, Default)]
pub struct VaFlags {
    pub kernel: bool,
    pub big_pages: bool,
    pub fixed_offset: Option<u64>,
}

impl VaFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve from the kernel-owned top of the space.
    #[must_use]
    pub const fn kernel(mut self) -> Self {
        self.kernel = true;
        self
    }

    #[must_use]
    pub const fn big_pages(mut self) -> Self {
        self.big_pages = true;
        self
    }

    /// Place the reservation at exactly `addr`.
    #[must_use]
    pub const fn fixed(mut self, addr: u64) -> Self {
        self.fixed_offset = Some(addr);
        self
    }
}

/// A reserved GPU virtual address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    pub addr: u64,
    pub len: u64,
    pub page_size: u64,
    pub kernel: bool,
}

/// One GPU virtual address space.
///
/// The space is split in two buddy allocators: the bottom serves user reservations and the top
/// `kernel_len` bytes are kept for driver-owned mappings. Both run in GVA mode so small-page and
/// big-page reservations never share a page-directory entry.
#[derive(Debug)]
pub struct VaSpace {
    id: u32,
    small_page: u64,
    big_page: u64,
    user: BuddyAllocator,
    kernel: BuddyAllocator,
}

impl VaSpace {
    pub fn new(
        id: u32,
        base: u64,
        len: u64,
        kernel_len: u64,
        small_page: u64,
        big_page: u64,
    ) -> FifoResult<Self> {
        if !small_page.is_power_of_two() || !big_page.is_power_of_two() || big_page < small_page {
            return Err(FifoError::InvalidConfig(format!(
                "vm {id}: page sizes {small_page:#x}/{big_page:#x}"
            )));
        }
        if kernel_len == 0 {
            return Err(FifoError::InvalidConfig(format!(
                "vm {id}: kernel region must not be empty"
            )));
        }
        if !is_aligned(base, big_page) || !is_aligned(kernel_len, big_page) || kernel_len >= len {
            return Err(FifoError::InvalidConfig(format!(
                "vm {id}: layout {base:#x}+{len:#x} with {kernel_len:#x} kernel bytes"
            )));
        }

        let options = AllocatorOptions::new()
            .with_flags(AllocatorFlags::GVA_SPACE)
            .with_pte_block_len(big_page * BIG_PAGES_PER_PDE);
        let user_len = len - kernel_len;
        let user = BuddyAllocator::new(
            &format!("vm{id}-user"),
            base,
            user_len,
            small_page,
            None,
            options,
        )?;
        let kernel = BuddyAllocator::new(
            &format!("vm{id}-kernel"),
            base + user_len,
            kernel_len,
            small_page,
            None,
            options,
        )?;

        log::debug!(
            "vm {id}: user {base:#x}+{user_len:#x}, kernel {:#x}+{kernel_len:#x}",
            base + user_len
        );

        Ok(Self {
            id,
            small_page,
            big_page,
            user,
            kernel,
        })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    fn region(&self, kernel: bool) -> &dyn RangeAllocator {
        if kernel { &self.kernel } else { &self.user }
    }

    /// Reserves at least `len` bytes, rounded to the page size the flags select.
    pub fn reserve(&self, len: u64, flags: VaFlags) -> FifoResult<VaRange> {
        let (page_size, class) = if flags.big_pages {
            (self.big_page, PageSizeClass::Big)
        } else {
            (self.small_page, PageSizeClass::Small)
        };
        let len = align_up(len.max(1), page_size);
        let region = self.region(flags.kernel);

        let addr = match flags.fixed_offset {
            Some(addr) => {
                if !is_aligned(addr, page_size) {
                    return Err(FifoError::InvalidRange { base: addr, len });
                }
                region.allocate_range_fixed(addr, len, class)?
            }
            None => region.allocate_range(len, class)?,
        };

        log::debug!(
            "vm {}: reserved {addr:#x}+{len:#x} ({} pages of {page_size:#x})",
            self.id,
            len / page_size
        );
        Ok(VaRange {
            addr,
            len,
            page_size,
            kernel: flags.kernel,
        })
    }

    pub fn release(&self, range: &VaRange) {
        log::debug!("vm {}: release {:#x}+{:#x}", self.id, range.addr, range.len);
        self.region(range.kernel).free_range(range.addr);
    }

    /// Whether `addr` is inside either region.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.user.contains(addr) || self.kernel.contains(addr)
    }

    #[must_use]
    pub fn stats(&self, kernel: bool) -> AllocatorStats {
        if kernel {
            self.kernel.stats()
        } else {
            self.user.stats()
        }
    }

    /// Tears down both regions. Outstanding reservations are released.
    pub fn destroy(self) {
        self.user.destroy();
        self.kernel.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: u64 = 4 << 10;
    const BIG: u64 = 64 << 10;

    fn space() -> VaSpace {
        VaSpace::new(1, 1 << 30, 1 << 30, 64 << 20, SMALL, BIG).unwrap()
    }

    #[test]
    fn test_reserve_rounds_to_page_size() {
        let vm = space();
        let r = vm.reserve(5000, VaFlags::new()).unwrap();
        assert_eq!(r.len, 2 * SMALL);
        assert_eq!(r.page_size, SMALL);
        assert!(!r.kernel);

        let big = vm.reserve(1, VaFlags::new().big_pages()).unwrap();
        assert_eq!(big.len, BIG);
        assert_eq!(big.addr % BIG, 0);

        let k = vm.reserve(SMALL, VaFlags::new().kernel()).unwrap();
        assert!(k.addr >= (1 << 31) - (64 << 20));
        assert!(vm.contains(k.addr));

        vm.release(&r);
        vm.release(&big);
        vm.release(&k);
        vm.destroy();
    }

    #[test]
    fn test_fixed_reservation() {
        let vm = space();
        let at = (1 << 30) + (16 << 20);
        let r = vm.reserve(3 * SMALL, VaFlags::new().fixed(at)).unwrap();
        assert_eq!(r.addr, at);
        assert!(matches!(
            vm.reserve(SMALL, VaFlags::new().fixed(at + SMALL)),
            Err(FifoError::RangeInUse { .. })
        ));
        assert!(matches!(
            vm.reserve(SMALL, VaFlags::new().fixed(at + 1)),
            Err(FifoError::InvalidRange { .. })
        ));
        vm.release(&r);
        assert_eq!(vm.stats(false).live_fixed, 0);
    }

    #[test]
    fn test_bad_layout() {
        assert!(VaSpace::new(0, 0x1000, 1 << 30, 0, SMALL, BIG).is_err());
        assert!(VaSpace::new(0, 0, 1 << 20, 1 << 20, SMALL, BIG).is_err());
        assert!(VaSpace::new(0, 0, 1 << 30, 0, BIG, SMALL).is_err());
    }

    #[test]
    fn test_empty_kernel_region_rejected() {
        match VaSpace::new(2, 0, 1 << 30, 0, SMALL, BIG) {
            Err(FifoError::InvalidConfig(msg)) => assert!(msg.contains("kernel region")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }
}

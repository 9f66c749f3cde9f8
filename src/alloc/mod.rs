pub(crate) mod block;
pub mod buddy;
pub mod stats;
pub mod vm;

use crate::error::FifoResult;
use bitflags::bitflags;

/// Page-size class a block is reserved for in a GPU virtual address space.
///
/// Blocks no larger than one page-directory entry inherit the class of the request that split
/// them, so small-page and big-page mappings never share a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageSizeClass {
    #[default]
    Any,
    Small,
    Big,
}

impl PageSizeClass {
    /// Whether a block tagged `self` may satisfy a request for `wanted`.
    #[must_use]
    pub fn accepts(self, wanted: Self) -> bool {
        self == Self::Any || wanted == Self::Any || self == wanted
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocatorFlags: u32 {
        /// The space holds GPU virtual addresses; track page-size classes per block.
        const GVA_SPACE = 1 << 0;
    }
}

/// Optional allocator behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorOptions {
    pub flags: AllocatorFlags,
    /// Bytes covered by one page-directory entry. Only used with [`AllocatorFlags::GVA_SPACE`].
    pub pte_block_len: u64,
}

impl AllocatorOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: AllocatorFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_pte_block_len(mut self, len: u64) -> Self {
        self.pte_block_len = len;
        self
    }
}

/// Strategy for handing out ranges of a numeric space.
pub trait RangeAllocator: Send + Sync {
    /// Reserve `len` bytes anywhere in the space.
    fn allocate_range(&self, len: u64, class: PageSizeClass) -> FifoResult<u64>;

    /// Reserve exactly `[base, base + len)`.
    fn allocate_range_fixed(&self, base: u64, len: u64, class: PageSizeClass) -> FifoResult<u64>;

    /// Release a range previously returned by one of the allocate calls.
    fn free_range(&self, addr: u64);

    /// The usable `[start, end)` of the space.
    fn bounds(&self) -> (u64, u64);
}

pub use buddy::BuddyAllocator;
pub use stats::{AllocatorStats, OrderStats};
pub use vm::{VaFlags, VaRange, VaSpace};

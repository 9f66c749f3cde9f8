use std::fmt;

/// Counters for one block order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderStats {
    pub order: u32,
    /// Bytes covered by one block of this order.
    pub block_len: u64,
    pub free: u64,
    pub alloced: u64,
    pub split: u64,
}

/// Point-in-time snapshot of a buddy allocator.
#[derive(Debug, Clone)]
pub struct AllocatorStats {
    pub name: String,
    pub base: u64,
    pub length: u64,
    pub start: u64,
    pub end: u64,
    pub block_size: u64,
    pub max_order: u32,
    /// Bytes of the requested range dropped to align it to the block size.
    pub align_loss: u64,
    /// Sum of the lengths callers asked for.
    pub bytes_requested: u64,
    /// Sum of the block-rounded lengths actually handed out.
    pub bytes_reserved: u64,
    pub bytes_freed: u64,
    pub live_allocations: u64,
    pub live_fixed: u64,
    pub orders: Vec<OrderStats>,
}

impl AllocatorStats {
    /// Bytes sitting in free lists.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.orders.iter().map(|o| o.free * o.block_len).sum()
    }

    /// Bytes held by allocated blocks, fixed tiles included.
    #[must_use]
    pub fn alloced_bytes(&self) -> u64 {
        self.orders.iter().map(|o| o.alloced * o.block_len).sum()
    }

    /// Bytes still reserved by callers.
    #[must_use]
    pub const fn outstanding_bytes(&self) -> u64 {
        self.bytes_reserved - self.bytes_freed
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "buddy allocator '{}'", self.name)?;
        writeln!(
            f,
            "  range      0x{:x} + 0x{:x} (usable 0x{:x} - 0x{:x}, {} bytes lost)",
            self.base, self.length, self.start, self.end, self.align_loss
        )?;
        writeln!(
            f,
            "  block      0x{:x}, max order {}",
            self.block_size, self.max_order
        )?;
        writeln!(
            f,
            "  bytes      requested {} reserved {} freed {}",
            self.bytes_requested, self.bytes_reserved, self.bytes_freed
        )?;
        writeln!(
            f,
            "  live       {} allocations, {} fixed",
            self.live_allocations, self.live_fixed
        )?;
        writeln!(f, "  order  {:>12}  {:>6}  {:>6}  {:>6}", "block", "free", "alloc", "split")?;
        for o in self.orders.iter().rev() {
            if o.free == 0 && o.alloced == 0 && o.split == 0 {
                continue;
            }
            writeln!(
                f,
                "  {:>5}  {:>12x}  {:>6}  {:>6}  {:>6}",
                o.order, o.block_len, o.free, o.alloced, o.split
            )?;
        }
        Ok(())
    }
}

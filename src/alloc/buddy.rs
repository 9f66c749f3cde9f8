#![allow(clippy::cast_possible_truncation)]

use super::block::{Block, BlockArena, BlockFlags, BlockId};
use super::stats::{AllocatorStats, OrderStats};
use super::{AllocatorFlags, AllocatorOptions, PageSizeClass, RangeAllocator};
use crate::error::{FifoError, FifoResult};
use crate::utils::{align_down, align_up, ilog2, order_for};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Largest order any allocator can be configured with.
pub const MAX_ORDER: u32 = 63;

/// A caller-placed range, tiled by buddy blocks of possibly differing orders.
#[derive(Debug)]
struct FixedAlloc {
    len: u64,
    tiles: Vec<BlockId>,
}

#[derive(Debug, Default, Clone, Copy)]
struct OrderCounters {
    alloced: u64,
    split: u64,
}

/// Everything behind the allocator lock.
///
/// Helpers on this type assume the lock is already held by the public entry point that called
/// them; none of them lock again.
#[derive(Debug)]
struct BuddyState {
    arena: BlockArena,
    alloced: BTreeMap<u64, BlockId>,
    fixed: BTreeMap<u64, FixedAlloc>,
    counters: Vec<OrderCounters>,
    bytes_requested: u64,
    bytes_reserved: u64,
    bytes_freed: u64,
}

/// Power-of-two buddy allocator over a flat numeric space.
///
/// Addresses handed out are absolute (inside `[start, end)`). Internally every block is
/// described by its offset from `start` in minimum-size blocks, so buddy alignment is relative
/// to the aligned start of the space rather than to zero.
#[derive(Debug)]
pub struct BuddyAllocator {
    name: String,
    base: u64,
    length: u64,
    start: u64,
    end: u64,
    blk_size: u64,
    blk_shift: u32,
    max_order: u32,
    pte_blk_order: u32,
    flags: AllocatorFlags,
    state: Mutex<BuddyState>,
}

impl BuddyAllocator {
    /// Creates an allocator over `[base, base + length)`.
    ///
    /// The range is shrunk to `block_size` boundaries; the bytes lost that way are reported by
    /// [`AllocatorStats::align_loss`]. `max_order` defaults to the largest order that fits the
    /// space and is silently capped to it when larger.
    pub fn new(
        name: &str,
        base: u64,
        length: u64,
        block_size: u64,
        max_order: Option<u32>,
        options: AllocatorOptions,
    ) -> FifoResult<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FifoError::InvalidConfig(format!(
                "{name}: block size {block_size:#x} is not a power of two"
            )));
        }
        if length == 0 {
            return Err(FifoError::InvalidConfig(format!("{name}: empty range")));
        }
        let Some(limit) = base.checked_add(length) else {
            return Err(FifoError::InvalidConfig(format!(
                "{name}: range {base:#x}+{length:#x} wraps"
            )));
        };

        let blk_shift = block_size.trailing_zeros();
        if let Some(order) = max_order {
            if order > MAX_ORDER - blk_shift {
                return Err(FifoError::InvalidConfig(format!(
                    "{name}: max order {order} overflows with block size {block_size:#x}"
                )));
            }
        }

        let start = align_up(base, block_size);
        let end = align_down(limit, block_size);
        if end <= start {
            return Err(FifoError::InvalidConfig(format!(
                "{name}: range {base:#x}+{length:#x} holds no {block_size:#x} block"
            )));
        }

        let blocks = (end - start) >> blk_shift;
        let space_order = ilog2(blocks);
        let max_order = max_order.map_or(space_order, |o| o.min(space_order));

        let pte_blk_order = if options.flags.contains(AllocatorFlags::GVA_SPACE) {
            if options.pte_block_len < block_size {
                return Err(FifoError::InvalidConfig(format!(
                    "{name}: PDE block length {:#x} below block size",
                    options.pte_block_len
                )));
            }
            order_for(options.pte_block_len >> blk_shift)
        } else {
            0
        };

        let mut state = BuddyState {
            arena: BlockArena::new(max_order),
            alloced: BTreeMap::new(),
            fixed: BTreeMap::new(),
            counters: vec![OrderCounters::default(); max_order as usize + 1],
            bytes_requested: 0,
            bytes_reserved: 0,
            bytes_freed: 0,
        };

        // Greedy left-to-right tiling with the largest aligned order that still fits.
        let mut pos = 0;
        while pos < blocks {
            let mut order = ilog2(blocks - pos).min(max_order);
            if pos != 0 {
                order = order.min(pos.trailing_zeros());
            }
            let id = state.arena.insert(Block::new(pos, order, None));
            state.arena.push_back(id);
            pos += 1 << order;
        }

        log::debug!(
            "buddy {name}: [{start:#x}, {end:#x}) blk {block_size:#x} max_order {max_order} \
             ({} top-level blocks, {} bytes lost to alignment)",
            state.arena.live(),
            length - (end - start)
        );

        Ok(Self {
            name: name.to_string(),
            base,
            length,
            start,
            end,
            blk_size: block_size,
            blk_shift,
            max_order,
            pte_blk_order,
            flags: options.flags,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.blk_size
    }

    #[must_use]
    pub const fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Whether `addr` lies inside the managed (aligned) space.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    const fn is_gva(&self) -> bool {
        self.flags.contains(AllocatorFlags::GVA_SPACE)
    }

    const fn addr_of(&self, pos: u64) -> u64 {
        self.start + (pos << self.blk_shift)
    }

    const fn pos_of(&self, addr: u64) -> u64 {
        (addr - self.start) >> self.blk_shift
    }

    const fn order_len(&self, order: u32) -> u64 {
        self.blk_size << order
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Allocates `len` bytes rounded up to a power-of-two number of blocks.
    pub fn allocate(&self, len: u64) -> FifoResult<u64> {
        self.allocate_with_class(len, PageSizeClass::Any)
    }

    /// Allocates from blocks compatible with `class`. Outside GVA mode the class is ignored.
    pub fn allocate_with_class(&self, len: u64, class: PageSizeClass) -> FifoResult<u64> {
        if len == 0 {
            return Err(FifoError::InvalidConfig(format!(
                "{}: zero-length allocation",
                self.name
            )));
        }
        let order = order_for(len.div_ceil(self.blk_size));
        if order > self.max_order {
            return Err(FifoError::TooLarge {
                len,
                order,
                max_order: self.max_order,
            });
        }
        let class = if self.is_gva() {
            class
        } else {
            PageSizeClass::Any
        };

        let mut st = self.state.lock();
        let Some(found) = self.find_free(&st, order, class) else {
            log::debug!("buddy {}: no free block for order {order}", self.name);
            return Err(FifoError::Exhausted);
        };

        let mut id = found;
        st.arena.unlink(id);
        while st.arena.get(id).order > order {
            id = self.split(&mut st, id, class);
        }

        self.mark_allocated(&mut st, id);
        let pos = st.arena.get(id).pos;
        let addr = self.addr_of(pos);
        st.alloced.insert(addr, id);
        st.bytes_requested += len;
        st.bytes_reserved += self.order_len(order);

        log::debug!(
            "buddy {}: alloc {len:#x} -> {addr:#x} (order {order})",
            self.name
        );
        Ok(addr)
    }

    /// Reserves exactly `[base, base + len)`.
    ///
    /// Both ends must be block aligned and inside the managed space.
    pub fn allocate_fixed(&self, base: u64, len: u64) -> FifoResult<u64> {
        self.allocate_fixed_with_class(base, len, PageSizeClass::Any)
    }

    pub fn allocate_fixed_with_class(
        &self,
        base: u64,
        len: u64,
        class: PageSizeClass,
    ) -> FifoResult<u64> {
        let in_space = base
            .checked_add(len)
            .is_some_and(|limit| base >= self.start && limit <= self.end);
        if len == 0 || !in_space || base % self.blk_size != 0 || len % self.blk_size != 0 {
            return Err(FifoError::InvalidRange { base, len });
        }
        let class = if self.is_gva() {
            class
        } else {
            PageSizeClass::Any
        };

        let mut st = self.state.lock();
        if self.overlaps(&st, base, len) {
            log::debug!(
                "buddy {}: fixed {base:#x}+{len:#x} overlaps a live allocation",
                self.name
            );
            return Err(FifoError::RangeInUse { base, len });
        }

        let first = self.pos_of(base);
        let last = first + (len >> self.blk_shift);
        let mut tiles = Vec::new();
        let mut pos = first;
        while pos < last {
            let mut order = ilog2(last - pos).min(self.max_order);
            if pos != 0 {
                order = order.min(pos.trailing_zeros());
            }

            let Some(tile) = self.make_fixed_buddy(&mut st, pos, order, class) else {
                log::warn!(
                    "buddy {}: fixed {base:#x}+{len:#x} failed at {:#x}, rolling back {} tiles",
                    self.name,
                    self.addr_of(pos),
                    tiles.len()
                );
                for tile in tiles {
                    self.release_block(&mut st, tile);
                }
                return Err(FifoError::Exhausted);
            };

            self.mark_allocated(&mut st, tile);
            tiles.push(tile);
            pos += 1 << order;
        }

        log::debug!(
            "buddy {}: fixed {base:#x}+{len:#x} ({} tiles)",
            self.name,
            tiles.len()
        );
        st.fixed.insert(base, FixedAlloc { len, tiles });
        st.bytes_requested += len;
        st.bytes_reserved += len;
        Ok(base)
    }

    /// Releases the allocation (ordinary or fixed) starting at `addr`.
    ///
    /// Freeing an address that is not the start of a live allocation does nothing.
    pub fn free(&self, addr: u64) {
        let mut st = self.state.lock();

        if let Some(id) = st.alloced.remove(&addr) {
            let order = st.arena.get(id).order;
            st.bytes_freed += self.order_len(order);
            self.release_block(&mut st, id);
            log::debug!("buddy {}: free {addr:#x} (order {order})", self.name);
            return;
        }

        if let Some(fixed) = st.fixed.remove(&addr) {
            st.bytes_freed += fixed.len;
            for tile in fixed.tiles {
                self.release_block(&mut st, tile);
            }
            log::debug!("buddy {}: free fixed {addr:#x}+{:#x}", self.name, fixed.len);
            return;
        }

        log::warn!("buddy {}: free of untracked address {addr:#x}", self.name);
    }

    /// Tears the allocator down, releasing whatever is still allocated.
    ///
    /// # Panics
    /// Panics if the block tree does not fully recombine, which means a block leaked.
    pub fn destroy(self) {
        let outstanding_fixed: Vec<u64> = self.state.lock().fixed.keys().copied().collect();
        for addr in outstanding_fixed {
            self.free(addr);
        }
        let outstanding: Vec<u64> = self.state.lock().alloced.keys().copied().collect();
        if !outstanding.is_empty() {
            log::warn!(
                "buddy {}: destroying with {} live allocations",
                self.name,
                outstanding.len()
            );
        }
        for addr in outstanding {
            self.free(addr);
        }

        let mut st = self.state.lock();
        for order in 0..=self.max_order {
            while let Some(id) = st.arena.list_head(order) {
                st.arena.unlink(id);
                let block = st.arena.remove(id);
                assert!(
                    block.parent.is_none(),
                    "buddy {}: unmerged child at {:#x} (order {order})",
                    self.name,
                    self.addr_of(block.pos)
                );
            }
        }

        for (order, c) in st.counters.iter().enumerate() {
            assert!(
                c.alloced == 0 && c.split == 0,
                "buddy {}: order {order} still has {} allocated and {} split blocks",
                self.name,
                c.alloced,
                c.split
            );
        }
        assert_eq!(st.arena.live(), 0, "buddy {}: leaked blocks", self.name);
        log::debug!("buddy {}: destroyed", self.name);
    }

    /// Snapshot of the per-order counters and byte accounting.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let st = self.state.lock();
        let orders = (0..=self.max_order)
            .map(|order| {
                let c = st.counters[order as usize];
                OrderStats {
                    order,
                    block_len: self.order_len(order),
                    free: st.arena.list_len(order) as u64,
                    alloced: c.alloced,
                    split: c.split,
                }
            })
            .collect();

        AllocatorStats {
            name: self.name.clone(),
            base: self.base,
            length: self.length,
            start: self.start,
            end: self.end,
            block_size: self.blk_size,
            max_order: self.max_order,
            align_loss: self.length - (self.end - self.start),
            bytes_requested: st.bytes_requested,
            bytes_reserved: st.bytes_reserved,
            bytes_freed: st.bytes_freed,
            live_allocations: st.alloced.len() as u64,
            live_fixed: st.fixed.len() as u64,
            orders,
        }
    }

    // ===========================================================================================
    // Internal helpers (lock held)
    // ===========================================================================================

    fn overlaps(&self, st: &BuddyState, base: u64, len: u64) -> bool {
        let end = base + len;
        // Both indexes hold disjoint ranges, so only the last entry starting before `end`
        // can reach past `base`.
        let alloced_hit = st
            .alloced
            .range(..end)
            .next_back()
            .is_some_and(|(&addr, &id)| addr + self.order_len(st.arena.get(id).order) > base);
        let fixed_hit = st
            .fixed
            .range(..end)
            .next_back()
            .is_some_and(|(&addr, f)| addr + f.len > base);
        alloced_hit || fixed_hit
    }

    /// First free block of `order` or above whose class is compatible with `class`.
    fn find_free(&self, st: &BuddyState, order: u32, class: PageSizeClass) -> Option<BlockId> {
        let from_tail = self.is_gva() && class == PageSizeClass::Big;
        (order..=self.max_order).find_map(|o| {
            st.arena
                .iter_list(o, from_tail)
                .find(|&id| st.arena.get(id).class.accepts(class))
        })
    }

    /// Splits an unlisted free block, lists the right half and returns the left half unlisted.
    fn split(&self, st: &mut BuddyState, id: BlockId, class: PageSizeClass) -> BlockId {
        let (pos, order) = {
            let block = st.arena.get(id);
            assert!(
                !block.is_split() && !block.is_allocated() && !block.is_free(),
                "buddy {}: splitting block at {:#x} in state {:?}",
                self.name,
                self.addr_of(block.pos),
                block.flags
            );
            (block.pos, block.order)
        };
        assert!(order > 0, "buddy {}: splitting an order-0 block", self.name);

        let child_order = order - 1;
        let mut left = Block::new(pos, child_order, Some(id));
        let mut right = Block::new(pos + (1 << child_order), child_order, Some(id));
        if self.is_gva() && child_order <= self.pte_blk_order {
            left.class = class;
            right.class = class;
        }
        let l = st.arena.insert(left);
        let r = st.arena.insert(right);
        st.arena.get_mut(l).buddy = Some(r);
        st.arena.get_mut(r).buddy = Some(l);

        let parent = st.arena.get_mut(id);
        parent.left = Some(l);
        parent.right = Some(r);
        parent.flags.insert(BlockFlags::SPLIT);
        st.counters[order as usize].split += 1;

        self.list_add(st, r);
        l
    }

    /// Finds the free block at `pos` with exactly `order`, splitting an ancestor if needed.
    /// The returned block is unlisted.
    fn make_fixed_buddy(
        &self,
        st: &mut BuddyState,
        pos: u64,
        order: u32,
        class: PageSizeClass,
    ) -> Option<BlockId> {
        let mut found = None;
        for cur in order..=self.max_order {
            let cur_pos = pos & !((1u64 << cur) - 1);
            let hit = st.arena.iter_list(cur, false).find(|&id| {
                let block = st.arena.get(id);
                block.pos == cur_pos && block.class.accepts(class)
            });
            if hit.is_some() {
                found = hit;
                break;
            }
        }

        let mut id = found?;
        st.arena.unlink(id);
        loop {
            let block = st.arena.get(id);
            if block.pos == pos && block.order == order {
                return Some(id);
            }
            let left = self.split(st, id, class);
            let right = st.arena.get(id).right?;
            if pos < st.arena.get(right).pos {
                id = left;
            } else {
                st.arena.unlink(right);
                self.list_add(st, left);
                id = right;
            }
        }
    }

    fn mark_allocated(&self, st: &mut BuddyState, id: BlockId) {
        let block = st.arena.get_mut(id);
        assert!(
            !block.flags.intersects(BlockFlags::IN_LIST | BlockFlags::ALLOCATED | BlockFlags::SPLIT),
            "buddy {}: allocating block in state {:?}",
            self.name,
            block.flags
        );
        block.flags.insert(BlockFlags::ALLOCATED);
        let order = block.order as usize;
        st.counters[order].alloced += 1;
    }

    /// Returns an allocated block to its free list and merges upward.
    fn release_block(&self, st: &mut BuddyState, id: BlockId) {
        let block = st.arena.get_mut(id);
        assert!(
            block.is_allocated(),
            "buddy {}: releasing unallocated block",
            self.name
        );
        block.flags.remove(BlockFlags::ALLOCATED);
        let order = block.order as usize;
        st.counters[order].alloced -= 1;
        self.list_add(st, id);
        self.coalesce(st, id);
    }

    fn coalesce(&self, st: &mut BuddyState, mut id: BlockId) {
        loop {
            let block = st.arena.get(id);
            let (Some(parent), Some(buddy)) = (block.parent, block.buddy) else {
                return;
            };
            let bud = st.arena.get(buddy);
            if !block.is_free() || !bud.is_free() {
                return;
            }

            st.arena.unlink(id);
            st.arena.unlink(buddy);
            st.arena.remove(id);
            st.arena.remove(buddy);

            let p = st.arena.get_mut(parent);
            p.flags.remove(BlockFlags::SPLIT);
            p.left = None;
            p.right = None;
            let order = p.order as usize;
            st.counters[order].split -= 1;
            self.list_add(st, parent);
            id = parent;
        }
    }

    fn list_add(&self, st: &mut BuddyState, id: BlockId) {
        if self.is_gva() && st.arena.get(id).class == PageSizeClass::Big {
            st.arena.push_back(id);
        } else {
            st.arena.push_front(id);
        }
    }
}

impl RangeAllocator for BuddyAllocator {
    fn allocate_range(&self, len: u64, class: PageSizeClass) -> FifoResult<u64> {
        self.allocate_with_class(len, class)
    }

    fn allocate_range_fixed(&self, base: u64, len: u64, class: PageSizeClass) -> FifoResult<u64> {
        self.allocate_fixed_with_class(base, len, class)
    }

    fn free_range(&self, addr: u64) {
        self.free(addr);
    }

    fn bounds(&self) -> (u64, u64) {
        (self.start, self.end)
    }
}

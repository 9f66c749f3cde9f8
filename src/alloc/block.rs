//! Node arena backing the buddy allocator.
//!
//! Blocks refer to each other (parent, children, buddy, free-list neighbours) through
//! [`BlockId`] handles into the arena rather than pointers. Only the arena owns nodes; a parent
//! does not own its children, it merely records where they live until they are merged back.

#![allow(clippy::cast_possible_truncation)]

use super::PageSizeClass;
use bitflags::bitflags;

/// Handle to a node in a [`BlockArena`]. Stale after the node is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        const IN_LIST = 1 << 0;
        const SPLIT = 1 << 1;
        const ALLOCATED = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    /// Offset from the allocator's start, in minimum-size blocks.
    pub pos: u64,
    pub order: u32,
    pub class: PageSizeClass,
    pub flags: BlockFlags,
    pub parent: Option<BlockId>,
    pub left: Option<BlockId>,
    pub right: Option<BlockId>,
    pub buddy: Option<BlockId>,
    prev: Option<BlockId>,
    next: Option<BlockId>,
}

impl Block {
    #[must_use]
    pub const fn new(pos: u64, order: u32, parent: Option<BlockId>) -> Self {
        Self {
            pos,
            order,
            class: PageSizeClass::Any,
            flags: BlockFlags::empty(),
            parent,
            left: None,
            right: None,
            buddy: None,
            prev: None,
            next: None,
        }
    }

    /// Number of minimum-size blocks covered.
    #[must_use]
    pub const fn span(&self) -> u64 {
        1 << self.order
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.pos + self.span()
    }

    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.flags.contains(BlockFlags::IN_LIST)
    }

    #[must_use]
    pub const fn is_split(&self) -> bool {
        self.flags.contains(BlockFlags::SPLIT)
    }

    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.flags.contains(BlockFlags::ALLOCATED)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FreeList {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

/// Slab of buddy nodes plus one intrusive doubly linked free list per order.
#[derive(Debug)]
pub struct BlockArena {
    nodes: Vec<Option<Block>>,
    vacant: Vec<BlockId>,
    lists: Vec<FreeList>,
}

impl BlockArena {
    #[must_use]
    pub fn new(max_order: u32) -> Self {
        Self {
            nodes: Vec::new(),
            vacant: Vec::new(),
            lists: vec![FreeList::default(); max_order as usize + 1],
        }
    }

    pub fn insert(&mut self, block: Block) -> BlockId {
        if let Some(id) = self.vacant.pop() {
            self.nodes[id.0 as usize] = Some(block);
            return id;
        }
        assert!(self.nodes.len() < u32::MAX as usize, "buddy arena overflow");
        let id = BlockId(self.nodes.len() as u32);
        self.nodes.push(Some(block));
        id
    }

    /// Drops a node. It must not be linked into a free list.
    pub fn remove(&mut self, id: BlockId) -> Block {
        let block = self.nodes[id.0 as usize]
            .take()
            .unwrap_or_else(|| panic!("buddy arena: double release of {id:?}"));
        assert!(!block.is_free(), "buddy arena: releasing listed block {id:?}");
        self.vacant.push(id);
        block
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> &Block {
        self.nodes[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("buddy arena: stale handle {id:?}"))
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        self.nodes[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("buddy arena: stale handle {id:?}"))
    }

    /// Number of live nodes, listed or not.
    #[must_use]
    pub fn live(&self) -> usize {
        self.nodes.len() - self.vacant.len()
    }

    // ===========================================================================================
    // Free Lists
    // ===========================================================================================

    #[must_use]
    pub fn list_len(&self, order: u32) -> usize {
        self.lists[order as usize].len
    }

    #[must_use]
    pub fn list_head(&self, order: u32) -> Option<BlockId> {
        self.lists[order as usize].head
    }

    pub fn push_front(&mut self, id: BlockId) {
        let order = self.link_prepare(id);
        let old_head = self.lists[order].head;
        {
            let block = self.get_mut(id);
            block.prev = None;
            block.next = old_head;
        }
        match old_head {
            Some(h) => self.get_mut(h).prev = Some(id),
            None => self.lists[order].tail = Some(id),
        }
        self.lists[order].head = Some(id);
        self.lists[order].len += 1;
    }

    pub fn push_back(&mut self, id: BlockId) {
        let order = self.link_prepare(id);
        let old_tail = self.lists[order].tail;
        {
            let block = self.get_mut(id);
            block.next = None;
            block.prev = old_tail;
        }
        match old_tail {
            Some(t) => self.get_mut(t).next = Some(id),
            None => self.lists[order].head = Some(id),
        }
        self.lists[order].tail = Some(id);
        self.lists[order].len += 1;
    }

    fn link_prepare(&mut self, id: BlockId) -> usize {
        let block = self.get_mut(id);
        assert!(
            !block.flags.intersects(BlockFlags::IN_LIST | BlockFlags::ALLOCATED | BlockFlags::SPLIT),
            "buddy: listing block at {} (order {}) in state {:?}",
            block.pos,
            block.order,
            block.flags
        );
        block.flags.insert(BlockFlags::IN_LIST);
        block.order as usize
    }

    pub fn unlink(&mut self, id: BlockId) {
        let (order, prev, next) = {
            let block = self.get_mut(id);
            assert!(block.is_free(), "buddy: unlinking unlisted block at {}", block.pos);
            block.flags.remove(BlockFlags::IN_LIST);
            let links = (block.order as usize, block.prev, block.next);
            block.prev = None;
            block.next = None;
            links
        };
        match prev {
            Some(p) => self.get_mut(p).next = next,
            None => self.lists[order].head = next,
        }
        match next {
            Some(n) => self.get_mut(n).prev = prev,
            None => self.lists[order].tail = prev,
        }
        self.lists[order].len -= 1;
    }

    /// Walks the free list of `order`, from the head or from the tail.
    pub fn iter_list(&self, order: u32, from_tail: bool) -> impl Iterator<Item = BlockId> + '_ {
        let list = self.lists[order as usize];
        let mut cursor = if from_tail { list.tail } else { list.head };
        std::iter::from_fn(move || {
            let id = cursor?;
            let block = self.get(id);
            cursor = if from_tail { block.prev } else { block.next };
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_order_and_unlink() {
        let mut arena = BlockArena::new(3);
        let a = arena.insert(Block::new(0, 1, None));
        let b = arena.insert(Block::new(2, 1, None));
        let c = arena.insert(Block::new(4, 1, None));
        arena.push_back(a);
        arena.push_back(b);
        arena.push_front(c);

        assert_eq!(arena.iter_list(1, false).collect::<Vec<_>>(), vec![c, a, b]);
        assert_eq!(arena.iter_list(1, true).collect::<Vec<_>>(), vec![b, a, c]);

        arena.unlink(a);
        assert_eq!(arena.list_len(1), 2);
        assert_eq!(arena.iter_list(1, false).collect::<Vec<_>>(), vec![c, b]);
        assert!(!arena.get(a).is_free());
    }

    #[test]
    fn test_slots_are_reused() {
        let mut arena = BlockArena::new(0);
        let a = arena.insert(Block::new(0, 0, None));
        arena.remove(a);
        let b = arena.insert(Block::new(1, 0, None));
        assert_eq!(a, b);
        assert_eq!(arena.live(), 1);
    }

    #[test]
    #[should_panic(expected = "listing block")]
    fn test_double_list_panics() {
        let mut arena = BlockArena::new(0);
        let a = arena.insert(Block::new(0, 0, None));
        arena.push_front(a);
        arena.push_front(a);
    }
}

use std::cell::Cell;
use std::ptr::null_mut;

use super::block::Block;

/// A Block has an embedded AllocationListEntry to provide the links between
/// Blocks in an AllocationList. The links are only touched while holding the
/// owning storage's allocation mutex, which is why they are plain cells even
/// though blocks are shared between threads.
pub struct AllocationListEntry {
    prev: Cell<*mut Block>,
    next: Cell<*mut Block>,
}

impl AllocationListEntry {
    pub const fn new() -> Self {
        Self {
            prev: Cell::new(null_mut()),
            next: Cell::new(null_mut()),
        }
    }
}

impl Default for AllocationListEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllocationListEntry {
    fn drop(&mut self) {
        assert!(self.prev.get().is_null(), "deleting attached block");
        assert!(self.next.get().is_null(), "deleting attached block");
    }
}

/// Doubly-linked list of Blocks that still have free entries. For all
/// operations with a block argument, the block must be from the list's
/// ObjStorage. New blocks go to the back; empty blocks are moved to the back
/// so deletion can find them from the tail.
pub struct AllocationList {
    head: *mut Block,
    tail: *mut Block,
}

impl AllocationList {
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
        }
    }

    pub const fn head(&self) -> *mut Block {
        self.head
    }

    pub const fn tail(&self) -> *mut Block {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn prev(&self, block: *mut Block) -> *mut Block {
        unsafe { (*block).allocation_list_entry().prev.get() }
    }

    pub fn next(&self, block: *mut Block) -> *mut Block {
        unsafe { (*block).allocation_list_entry().next.get() }
    }

    pub fn push_front(&mut self, block: *mut Block) {
        let old = self.head;
        if old.is_null() {
            self.head = block;
            self.tail = block;
        } else {
            unsafe {
                (*block).allocation_list_entry().next.set(old);
                (*old).allocation_list_entry().prev.set(block);
            }
            self.head = block;
        }
    }

    pub fn push_back(&mut self, block: *mut Block) {
        let old = self.tail;
        if old.is_null() {
            self.head = block;
            self.tail = block;
        } else {
            unsafe {
                (*old).allocation_list_entry().next.set(block);
                (*block).allocation_list_entry().prev.set(old);
            }
            self.tail = block;
        }
    }

    pub fn unlink(&mut self, block: *mut Block) {
        unsafe {
            let block_entry = (*block).allocation_list_entry();
            let prev_blk = block_entry.prev.get();
            let next_blk = block_entry.next.get();
            block_entry.prev.set(null_mut());
            block_entry.next.set(null_mut());

            if prev_blk.is_null() && next_blk.is_null() {
                assert_eq!(self.head, block, "invariant");
                assert_eq!(self.tail, block, "invariant");
                self.head = null_mut();
                self.tail = null_mut();
            } else if prev_blk.is_null() {
                assert_eq!(self.head, block, "invariant");
                (*next_blk).allocation_list_entry().prev.set(null_mut());
                self.head = next_blk;
            } else if next_blk.is_null() {
                assert_eq!(self.tail, block, "invariant");
                (*prev_blk).allocation_list_entry().next.set(null_mut());
                self.tail = prev_blk;
            } else {
                (*prev_blk).allocation_list_entry().next.set(next_blk);
                (*next_blk).allocation_list_entry().prev.set(prev_blk);
            }
        }
    }

    pub fn contains(&self, block: *mut Block) -> bool {
        !self.next(block).is_null() || self.tail == block
    }

    pub fn iter(&self) -> AllocationListIter<'_> {
        AllocationListIter {
            list: self,
            current: self.head,
        }
    }
}

impl Default for AllocationList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllocationList {
    fn drop(&mut self) {
        assert!(self.head.is_null(), "deleting attached list");
        assert!(self.tail.is_null(), "deleting attached list");
    }
}

pub struct AllocationListIter<'a> {
    list: &'a AllocationList,
    current: *mut Block,
}

impl<'a> Iterator for AllocationListIter<'a> {
    type Item = *mut Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        let block = self.current;
        self.current = self.list.next(block);
        Some(block)
    }
}

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use super::block::Block;
use crate::base::align_up;

/// Array of all active blocks. Refcounted for lock-free reclaim of the old
/// array when a new array is allocated for expansion.
///
/// The block pointers live in the same allocation, right after the header.
/// Entries are only added (push) or removed (remove) by a thread holding the
/// owner's allocation mutex; readers go through a refcounted snapshot and
/// only look at `[0, block_count_acquire())`.
#[repr(C)]
pub struct ActiveArray {
    size: usize,
    block_count: AtomicUsize,
    refcount: AtomicIsize,
}

impl ActiveArray {
    const fn blocks_offset() -> usize {
        align_up(size_of::<Self>(), align_of::<AtomicPtr<Block>>())
    }

    /// Bytes needed for an array of `size` blocks, or `None` if that does
    /// not fit an allocation.
    pub const fn byte_size(size: usize) -> Option<usize> {
        match size.checked_mul(size_of::<AtomicPtr<Block>>()) {
            Some(bytes) => match bytes.checked_add(Self::blocks_offset()) {
                Some(total) if total <= isize::MAX as usize => Some(total),
                _ => None,
            },
            None => None,
        }
    }

    /// Allocates an empty array with room for `size` blocks. Returns `None`
    /// when the size overflows or the system allocator fails.
    pub fn create(size: usize) -> Option<NonNull<Self>> {
        debug_assert!(size > 0, "empty active array");
        let byte_size = Self::byte_size(size)?;
        unsafe {
            let ptr = libc::malloc(byte_size).cast::<Self>();
            let this = NonNull::new(ptr)?;
            this.as_ptr().write(Self {
                size,
                block_count: AtomicUsize::new(0),
                refcount: AtomicIsize::new(0),
            });
            let base = (*this.as_ptr()).base_ptr() as *mut AtomicPtr<Block>;
            for i in 0..size {
                base.add(i).write(AtomicPtr::new(std::ptr::null_mut()));
            }
            Some(this)
        }
    }

    /// # Safety
    ///
    /// `array` must come from [`ActiveArray::create`] and have no remaining
    /// users.
    pub unsafe fn destroy(array: NonNull<Self>) {
        let refcount = array.as_ref().refcount.load(Ordering::Acquire);
        assert_eq!(refcount, 0, "destroying referenced active array");
        libc::free(array.as_ptr().cast());
    }

    #[inline]
    fn base_ptr(&self) -> *const AtomicPtr<Block> {
        let this = self as *const Self as usize;
        (this + Self::blocks_offset()) as _
    }

    #[inline]
    fn block_ptr(&self, index: usize) -> &AtomicPtr<Block> {
        assert!(index < self.size, "index out of bounds: {}", index);
        unsafe { &*self.base_ptr().add(index) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Relaxed)
    }

    /// Pairs with the release store in [`push`](Self::push): every block
    /// below the returned count is fully initialized.
    pub fn block_count_acquire(&self) -> usize {
        self.block_count.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> isize {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn increment_refcount(&self) {
        let old_value = self.refcount.fetch_add(1, Ordering::Relaxed);
        assert!(old_value >= 0, "negative refcount: {}", old_value);
    }

    /// Returns true if this dropped the last reference.
    pub fn decrement_refcount(&self) -> bool {
        let new_value = self.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(new_value >= 0, "negative refcount: {}", new_value);
        new_value == 0
    }

    #[inline]
    pub fn at(&self, index: usize) -> NonNull<Block> {
        debug_assert!(index < self.block_count_acquire(), "index out of bounds: {}", index);
        let block = self.block_ptr(index).load(Ordering::Relaxed);
        debug_assert!(!block.is_null());
        unsafe { NonNull::new_unchecked(block) }
    }

    /// Appends `block` if there is room. The count is published only after
    /// the pointer is stored, so a reader never sees an uninitialized slot.
    pub fn push(&self, block: NonNull<Block>) -> bool {
        let index = self.block_count();
        if index < self.size {
            unsafe { block.as_ref().set_active_index(index) };
            self.block_ptr(index).store(block.as_ptr(), Ordering::Relaxed);
            self.block_count.store(index + 1, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Removes `block` by moving the last block into its position.
    pub fn remove(&self, block: NonNull<Block>) {
        let count = self.block_count();
        assert!(count > 0, "array is empty");
        let index = unsafe { block.as_ref().active_index() };
        assert_eq!(
            self.block_ptr(index).load(Ordering::Relaxed),
            block.as_ptr(),
            "block not present at its active index"
        );
        let last_index = count - 1;
        let last_block = self.block_ptr(last_index).load(Ordering::Relaxed);
        unsafe { (*last_block).set_active_index(index) };
        self.block_ptr(index).store(last_block, Ordering::Relaxed);
        self.block_ptr(last_index).store(std::ptr::null_mut(), Ordering::Relaxed);
        self.block_count.store(last_index, Ordering::Relaxed);
    }

    /// Copies all blocks of `from`, keeping their indices.
    pub fn copy_from(&self, from: &Self) {
        assert_eq!(self.block_count(), 0, "precondition");
        let count = from.block_count();
        assert!(count <= self.size, "precondition");

        for i in 0..count {
            let block = from.block_ptr(i).load(Ordering::Relaxed);
            self.block_ptr(i).store(block, Ordering::Relaxed);
        }
        self.block_count.store(count, Ordering::Release);
    }

    /// Visits blocks in index order; stops early when `f` returns false.
    pub fn iterate<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&Block) -> bool,
    {
        let count = self.block_count_acquire();
        for i in 0..count {
            let block = self.at(i);
            if !f(unsafe { block.as_ref() }) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageId;

    fn new_blocks(n: usize) -> Vec<NonNull<Block>> {
        let owner = StorageId::next();
        (0..n).map(|_| Block::new(owner).expect("block allocation")).collect()
    }

    fn delete_blocks(blocks: Vec<NonNull<Block>>) {
        for block in blocks {
            unsafe { Block::delete(block) };
        }
    }

    #[test]
    fn test_push_until_full() {
        let blocks = new_blocks(3);
        let array = ActiveArray::create(2).expect("array allocation");
        let array_ref = unsafe { array.as_ref() };

        assert!(array_ref.push(blocks[0]));
        assert!(array_ref.push(blocks[1]));
        assert!(!array_ref.push(blocks[2]));
        assert_eq!(array_ref.block_count(), 2);
        assert_eq!(array_ref.at(1), blocks[1]);
        assert_eq!(unsafe { blocks[1].as_ref().active_index() }, 1);

        unsafe { ActiveArray::destroy(array) };
        delete_blocks(blocks);
    }

    #[test]
    fn test_remove_swaps_with_last() {
        let blocks = new_blocks(4);
        let array = ActiveArray::create(4).expect("array allocation");
        let array_ref = unsafe { array.as_ref() };
        for block in &blocks {
            assert!(array_ref.push(*block));
        }

        array_ref.remove(blocks[1]);
        assert_eq!(array_ref.block_count(), 3);
        assert_eq!(array_ref.at(1), blocks[3]);
        assert_eq!(unsafe { blocks[3].as_ref().active_index() }, 1);

        // Removing the last one only shrinks the count.
        array_ref.remove(blocks[2]);
        assert_eq!(array_ref.block_count(), 2);

        let mut seen = vec![];
        array_ref.iterate(|block| {
            seen.push(block as *const Block as *mut Block);
            true
        });
        assert_eq!(seen, vec![blocks[0].as_ptr(), blocks[3].as_ptr()]);

        unsafe { ActiveArray::destroy(array) };
        delete_blocks(blocks);
    }

    #[test]
    fn test_oversized_array_is_rejected() {
        assert!(ActiveArray::byte_size(usize::MAX).is_none());
        assert!(ActiveArray::byte_size(usize::MAX / 8 + 1).is_none());
        assert!(ActiveArray::create(1 << 61).is_none());
        assert!(ActiveArray::byte_size(4).unwrap() > 4 * size_of::<AtomicPtr<Block>>());
    }

    #[test]
    fn test_copy_and_refcount() {
        let blocks = new_blocks(2);
        let small = ActiveArray::create(2).expect("array allocation");
        let large = ActiveArray::create(4).expect("array allocation");
        unsafe {
            for block in &blocks {
                assert!(small.as_ref().push(*block));
            }
            large.as_ref().copy_from(small.as_ref());
            assert_eq!(large.as_ref().block_count(), 2);
            assert_eq!(large.as_ref().at(0), blocks[0]);
            assert_eq!(large.as_ref().size(), 4);

            large.as_ref().increment_refcount();
            large.as_ref().increment_refcount();
            assert!(!large.as_ref().decrement_refcount());
            assert!(large.as_ref().decrement_refcount());

            ActiveArray::destroy(small);
            ActiveArray::destroy(large);
        }
        delete_blocks(blocks);
    }
}

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use memoffset::offset_of;

use super::allocation_list::AllocationListEntry;
use super::slot::Slot;
use super::{ObjStorage, StorageId};
use crate::base::align_down;
use crate::base::utils::{count_trailing_ones, BITS_PER_WORD};
use crate::sync::LockFreeItem;

/// Number of entries in a block, and the most a single bulk allocation can
/// return.
pub const BULK_ALLOCATE_LIMIT: usize = BITS_PER_WORD;

const DATA_SIZE: usize = BULK_ALLOCATE_LIMIT * size_of::<Slot>();

/// Blocks are aligned to the size of their entry array, so aligning any entry
/// address down gives the start of its block's entries.
pub const BLOCK_ALIGNMENT: usize = DATA_SIZE;

const NULL_SLOT: Slot = Slot::null();

#[inline]
pub const fn is_full_bitmask(bitmask: usize) -> bool {
    !bitmask == 0
}

#[inline]
pub const fn is_empty_bitmask(bitmask: usize) -> bool {
    bitmask == 0
}

/// Fixed-sized array of entries, plus bookkeeping data.
/// All blocks are in the storage's active array, at the block's active index.
/// Non-full blocks are in the storage's allocation list, linked through the
/// block's allocation list entry. Empty blocks are at the end of that list.
#[repr(C)]
pub struct Block {
    data: [Slot; BULK_ALLOCATE_LIMIT],
    allocated_bitmask: AtomicUsize,
    owner: StorageId,
    active_index: AtomicUsize,
    allocation_list_entry: AllocationListEntry,
    deferred_updates_next: AtomicPtr<Block>,
    deferred_queued: AtomicBool,
    release_refcount: AtomicUsize,
}

// The list links are only written under the owner's allocation mutex;
// everything else is atomic.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl LockFreeItem for Block {
    fn next_ptr(&self) -> &AtomicPtr<Self> {
        &self.deferred_updates_next
    }
}

impl Block {
    fn layout() -> Layout {
        // BLOCK_ALIGNMENT is a power of two no smaller than the natural
        // alignment of Block.
        unsafe { Layout::from_size_align_unchecked(size_of::<Block>(), BLOCK_ALIGNMENT) }
    }

    /// Allocates a new empty block for `owner`. Returns `None` when the
    /// system allocator fails.
    pub fn new(owner: StorageId) -> Option<NonNull<Block>> {
        debug_assert_eq!(offset_of!(Block, data), 0, "entries must start the block");

        let block = unsafe { NonNull::new(std::alloc::alloc(Self::layout()).cast::<Block>())? };
        unsafe {
            block.as_ptr().write(Block {
                data: [NULL_SLOT; BULK_ALLOCATE_LIMIT],
                allocated_bitmask: AtomicUsize::new(0),
                owner,
                active_index: AtomicUsize::new(0),
                allocation_list_entry: AllocationListEntry::new(),
                deferred_updates_next: AtomicPtr::new(std::ptr::null_mut()),
                deferred_queued: AtomicBool::new(false),
                release_refcount: AtomicUsize::new(0),
            });
        }
        Some(block)
    }

    /// # Safety
    ///
    /// `block` must come from [`Block::new`], be detached from every list
    /// and array, and have no concurrent users.
    pub unsafe fn delete(block: NonNull<Block>) {
        std::ptr::drop_in_place(block.as_ptr());
        std::alloc::dealloc(block.as_ptr().cast(), Self::layout());
    }

    pub const fn size() -> usize {
        size_of::<Block>()
    }

    pub fn owner(&self) -> StorageId {
        self.owner
    }

    pub fn allocation_list_entry(&self) -> &AllocationListEntry {
        &self.allocation_list_entry
    }

    pub fn active_index(&self) -> usize {
        self.active_index.load(Ordering::Relaxed)
    }

    pub fn set_active_index(&self, index: usize) {
        self.active_index.store(index, Ordering::Relaxed);
    }

    pub fn allocated_bitmask(&self) -> usize {
        self.allocated_bitmask.load(Ordering::Relaxed)
    }

    pub fn allocated_bitmask_acquire(&self) -> usize {
        self.allocated_bitmask.load(Ordering::Acquire)
    }

    #[inline]
    pub fn check_index(&self, index: usize) {
        debug_assert!(index < BULK_ALLOCATE_LIMIT, "index out of bounds: {}", index);
    }

    #[inline]
    pub fn bitmask_for_index(&self, index: usize) -> usize {
        self.check_index(index);
        1 << index
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.data[index]
    }

    pub fn slot_ptr(&self, index: usize) -> NonNull<Slot> {
        NonNull::from(&self.data[index])
    }

    fn data_start(&self) -> usize {
        self.data.as_ptr() as usize
    }

    pub fn contains(&self, ptr: *const Slot) -> bool {
        let start = self.data_start();
        let addr = ptr as usize;
        start <= addr && addr < start + DATA_SIZE
    }

    pub fn get_index(&self, ptr: *const Slot) -> usize {
        debug_assert!(self.contains(ptr), "{:p} not in block {:p}", ptr, self);
        (ptr as usize - self.data_start()) / size_of::<Slot>()
    }

    pub fn bitmask_for_entry(&self, ptr: *const Slot) -> usize {
        self.bitmask_for_index(self.get_index(ptr))
    }

    pub fn is_full(&self) -> bool {
        is_full_bitmask(self.allocated_bitmask())
    }

    pub fn is_empty(&self) -> bool {
        is_empty_bitmask(self.allocated_bitmask())
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred_queued.load(Ordering::Acquire)
    }

    /// Clears the queued claim after the block was popped from the
    /// deferred-update list, making it claimable by the next release.
    pub(crate) fn clear_deferred(&self) {
        debug_assert!(self.deferred_updates_next.load(Ordering::Relaxed).is_null());
        self.deferred_queued.store(false, Ordering::SeqCst);
    }

    /// A block may be deleted only when it is empty, no release is still
    /// working on it, and it is not waiting on the deferred-update list.
    pub fn is_safe_to_delete(&self) -> bool {
        debug_assert!(self.is_empty(), "precondition");
        fence(Ordering::Acquire);
        self.release_refcount.load(Ordering::Acquire) == 0
            && !self.deferred_queued.load(Ordering::Acquire)
    }

    /// Allocates the lowest free entry. Only one thread allocates from a
    /// block at a time (the owner's allocation mutex); the update is atomic
    /// because releases may clear bits concurrently.
    pub fn allocate(&self) -> NonNull<Slot> {
        let allocated = self.allocated_bitmask();
        debug_assert!(!is_full_bitmask(allocated), "attempt to allocate from full block");
        let index = count_trailing_ones(allocated) as usize;
        self.allocated_bitmask
            .fetch_or(self.bitmask_for_index(index), Ordering::AcqRel);
        self.slot_ptr(index)
    }

    /// Claims every currently free entry and returns the claimed bits.
    ///
    /// The claim is a single CAS to the full mask. A release that clears a
    /// bit between our read and the update makes the CAS fail, so that bit
    /// is claimed too instead of being left free on an unlisted block.
    pub fn allocate_all(&self) -> usize {
        let mut old_allocated = self.allocated_bitmask();
        loop {
            debug_assert!(!is_full_bitmask(old_allocated), "attempt to allocate from full block");
            match self.allocated_bitmask.compare_exchange(
                old_allocated,
                !0,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return !old_allocated,
                Err(fetched) => old_allocated = fetched,
            }
        }
    }

    /// Clears `releasing` from the bitmask. May run concurrently with other
    /// releases on the same block. A transition to empty, or away from full,
    /// queues the block on the owner's deferred-update list so a later
    /// allocation-side pass can fix its allocation list membership.
    pub fn release_entries(&self, releasing: usize, owner: &ObjStorage) {
        debug_assert!(releasing != 0, "precondition");
        debug_assert_eq!(self.owner, owner.id(), "releasing into wrong storage");

        // Holds off empty block deletion until this release is done with
        // the block.
        self.release_refcount.fetch_add(1, Ordering::SeqCst);

        let mut old_allocated = self.allocated_bitmask();
        loop {
            debug_assert_eq!(
                releasing & !old_allocated,
                0,
                "releasing unallocated entries: {:#x} from {:#x}",
                releasing,
                old_allocated
            );
            let new_value = old_allocated ^ releasing;
            match self.allocated_bitmask.compare_exchange(
                old_allocated,
                new_value,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(fetched) => old_allocated = fetched,
            }
        }

        let became_empty = releasing == old_allocated;
        if became_empty || is_full_bitmask(old_allocated) {
            if became_empty {
                log::trace!(target: "objstorage-blocks", "{}: block empty {:p}", owner.name(), self);
            }
            if is_full_bitmask(old_allocated) {
                log::trace!(target: "objstorage-blocks", "{}: block not full {:p}", owner.name(), self);
            }
            // If someone else already queued the block, the pending update
            // will see our bitmask change when it is processed.
            if self
                .deferred_queued
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                unsafe {
                    owner
                        .deferred_updates
                        .push(self as *const Block as *mut Block);
                }
                // Leaving the full state is not urgent; allocation drains
                // the list before creating new blocks.
                if became_empty {
                    owner.record_needs_cleanup();
                }
                log::trace!(target: "objstorage-blocks", "{}: deferred update {:p}", owner.name(), self);
            }
        }

        self.release_refcount.fetch_sub(1, Ordering::Release);
    }

    /// Recovers the block holding `ptr` from the entry address alone.
    ///
    /// # Safety
    ///
    /// `ptr` must point into the entries of a live block.
    pub unsafe fn block_for_ptr(ptr: *const Slot) -> NonNull<Block> {
        let section = align_down(ptr as usize, BLOCK_ALIGNMENT);
        NonNull::new_unchecked((section - offset_of!(Block, data)) as *mut Block)
    }

    /// Visits every allocated entry; stops early when `f` returns false.
    pub fn iterate<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&Slot) -> bool,
    {
        let mut bitmask = self.allocated_bitmask_acquire();
        while bitmask != 0 {
            let index = bitmask.trailing_zeros() as usize;
            bitmask ^= self.bitmask_for_index(index);
            if !f(&self.data[index]) {
                return false;
            }
        }
        true
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        assert_eq!(
            *self.release_refcount.get_mut(),
            0,
            "deleting block while releasing"
        );
        assert!(!*self.deferred_queued.get_mut(), "deleting block in deferred list");
        *self.allocated_bitmask.get_mut() = 0;
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("address", &(self as *const Self))
            .field("allocated_bitmask", &format_args!("{:#x}", self.allocated_bitmask()))
            .field("owner", &self.owner)
            .field("active_index", &self.active_index())
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBlock(NonNull<Block>);

    unsafe impl Sync for TestBlock {}

    impl TestBlock {
        fn new() -> Self {
            Self(Block::new(StorageId::next()).expect("block allocation"))
        }
    }

    impl std::ops::Deref for TestBlock {
        type Target = Block;
        fn deref(&self) -> &Block {
            unsafe { self.0.as_ref() }
        }
    }

    impl Drop for TestBlock {
        fn drop(&mut self) {
            unsafe { Block::delete(self.0) }
        }
    }

    #[test]
    fn test_block_alignment() {
        let block = TestBlock::new();
        assert_eq!(block.0.as_ptr() as usize % BLOCK_ALIGNMENT, 0);
        for i in 0..BULK_ALLOCATE_LIMIT {
            let ptr = block.slot_ptr(i).as_ptr();
            assert_eq!(unsafe { Block::block_for_ptr(ptr) }, block.0);
            assert!(block.contains(ptr));
            assert_eq!(block.get_index(ptr), i);
        }
        let past_end = unsafe { block.slot_ptr(BULK_ALLOCATE_LIMIT - 1).as_ptr().add(1) };
        assert!(!block.contains(past_end));
    }

    #[test]
    fn test_allocate_lowest_free() {
        let block = TestBlock::new();
        assert!(block.is_empty());
        let first = block.allocate();
        let second = block.allocate();
        assert_eq!(block.get_index(first.as_ptr()), 0);
        assert_eq!(block.get_index(second.as_ptr()), 1);
        assert_eq!(block.allocated_bitmask(), 0b11);

        for _ in 2..BULK_ALLOCATE_LIMIT {
            block.allocate();
        }
        assert!(block.is_full());
    }

    #[test]
    fn test_allocate_all() {
        let block = TestBlock::new();
        block.allocate();
        let taken = block.allocate_all();
        assert_eq!(taken, !1usize);
        assert!(block.is_full());
    }

    #[test]
    fn test_allocate_all_races_release() {
        // Releases clear bits on one thread while another repeatedly claims
        // everything. Whatever the interleaving, each claim leaves the block
        // full and returns exactly the bits that were free at the claim.
        let block = TestBlock::new();
        for _ in 0..BULK_ALLOCATE_LIMIT {
            block.allocate();
        }
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..2000 {
                    let bit = 1usize << (round % BULK_ALLOCATE_LIMIT);
                    // Only clear bits that are set, like a real release.
                    let _ = block.allocated_bitmask.fetch_update(
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                        |mask| if mask & bit != 0 { Some(mask & !bit) } else { None },
                    );
                }
            });
            scope.spawn(|| {
                for _ in 0..2000 {
                    if !block.is_full() {
                        let before = block.allocated_bitmask();
                        let taken = block.allocate_all();
                        assert!(taken != 0);
                        // Releases only clear bits, so the claim covers at
                        // least what was free before it.
                        assert_eq!(!before & !taken, 0);
                    }
                }
            });
        });
        // A final claim picks up anything released after the last one.
        if !block.is_full() {
            block.allocate_all();
        }
        assert!(block.is_full());
        block.allocated_bitmask.store(0, Ordering::Relaxed);
    }

    #[test]
    fn test_iterate_skips_free_entries() {
        let block = TestBlock::new();
        for _ in 0..5 {
            block.allocate();
        }
        // Punch holes directly; the owner is irrelevant for iteration.
        block.allocated_bitmask.fetch_and(!0b10100, Ordering::Relaxed);

        let mut visited = vec![];
        assert!(block.iterate(|slot| {
            visited.push(block.get_index(slot as *const Slot));
            true
        }));
        assert_eq!(visited, vec![0, 1, 3]);

        let mut count = 0;
        assert!(!block.iterate(|_| {
            count += 1;
            count < 2
        }));
        assert_eq!(count, 2);
        block.allocated_bitmask.store(0, Ordering::Relaxed);
    }
}

//! ObjStorage supports management of off-heap references to objects
//! allocated in a garbage collected heap. An ObjStorage object provides a set
//! of object references (entries), which clients refer to via [`Slot`]
//! handles. Clients allocate entries to create a (possibly weak) reference to
//! an object, use that reference, and release the reference when no longer
//! needed.
//!
//! The garbage collector must know about all ObjStorage objects and their
//! reference strength. ObjStorage provides the garbage collector with support
//! for iteration over all the allocated entries.
//!
//! There are several categories of interaction with an ObjStorage object.
//!
//! 1. allocation and release of entries, by the mutator or the runtime.
//! 2. iteration by the garbage collector, possibly concurrent with mutators.
//! 3. iteration by other, non-GC, tools (only at safepoints).
//! 4. cleanup of unused internal storage, possibly concurrent with mutators.
//!
//! Internally, ObjStorage is a set of [`Block`]s, from which entries are
//! allocated and released. A block contains an entry array and a bitmask
//! indicating which entries are in use. New blocks are created when an
//! allocation finds no block with free entries; empty blocks may be deleted
//! by [`ObjStorage::delete_empty_blocks`].
//!
//! Allocation takes the allocation mutex. Release is lock-free: it updates
//! the block's bitmask with a CAS and, only when the block changes state
//! (became empty, or stopped being full), pushes the block on a lock-free
//! deferred-update list. Whoever next holds the allocation mutex pops those
//! blocks and fixes up their allocation list membership.

pub mod active_array;
pub mod allocation_list;
pub mod block;
pub mod cleanup;
pub mod par_state;
pub mod slot;
pub mod storage_set;

use std::alloc::{handle_alloc_error, Layout};
use std::collections::BTreeMap;
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};

use self::active_array::ActiveArray;
use self::allocation_list::AllocationList;
use self::block::{is_empty_bitmask, is_full_bitmask, Block, BULK_ALLOCATE_LIMIT};
use self::cleanup::CleanupScheduler;
use crate::base::utils::population_count;
use crate::base::{formatted_size, percent_of};
use crate::options::ObjStorageOptions;
use crate::safepoint;
use crate::sync::{CriticalSection, GlobalCounter, LockFreeStack, SharedFlag};

pub use self::par_state::{IterationData, ParState};
pub use self::slot::{EntryStatus, ObjRef, Slot};
pub use self::storage_set::StorageSet;

/// Identity of a storage, recorded in each of its blocks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StorageId(usize);

static NEXT_STORAGE_ID: AtomicUsize = AtomicUsize::new(1);

impl StorageId {
    pub(crate) fn next() -> Self {
        Self(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub type NumDeadCallback = Box<dyn Fn(usize) + Send + Sync>;

/// State guarded by the allocation mutex.
pub struct AllocationState {
    list: AllocationList,
    /// Start address of each block's entries, for checked address lookups.
    block_index: BTreeMap<usize, NonNull<Block>>,
}

/// State guarded by the active mutex.
struct ActiveState {
    /// Iterations in progress. Empty block deletion is suppressed while this
    /// is non-zero.
    iteration_count: usize,
    /// Deletion backed off because of an iteration; the last iteration to
    /// finish re-requests cleanup.
    deletion_suppressed: bool,
}

pub struct ObjStorage {
    name: String,
    id: StorageId,
    options: ObjStorageOptions,
    active_array: AtomicPtr<ActiveArray>,
    allocation: Mutex<AllocationState>,
    active: Mutex<ActiveState>,
    deferred_updates: LockFreeStack<Block>,
    allocation_count: AtomicUsize,
    num_dead_callback: OnceCell<NumDeadCallback>,
    needs_cleanup: SharedFlag,
    scheduler: Arc<CleanupScheduler>,
}

// Raw block pointers are only followed under the protocols described above.
unsafe impl Send for ObjStorage {}
unsafe impl Sync for ObjStorage {}

impl ObjStorage {
    pub fn new(name: impl Into<String>, options: ObjStorageOptions) -> Self {
        Self::with_scheduler(name, options, CleanupScheduler::global())
    }

    pub fn with_scheduler(
        name: impl Into<String>,
        options: ObjStorageOptions,
        scheduler: Arc<CleanupScheduler>,
    ) -> Self {
        let options = options.validated();
        let array = match ActiveArray::create(options.initial_active_array_size) {
            Some(array) => array,
            None => handle_alloc_error(Layout::new::<ActiveArray>()),
        };
        unsafe { array.as_ref().increment_refcount() };

        let storage = Self {
            name: name.into(),
            id: StorageId::next(),
            options,
            active_array: AtomicPtr::new(array.as_ptr()),
            allocation: Mutex::new(AllocationState {
                list: AllocationList::new(),
                block_index: BTreeMap::new(),
            }),
            active: Mutex::new(ActiveState {
                iteration_count: 0,
                deletion_suppressed: false,
            }),
            deferred_updates: LockFreeStack::new(),
            allocation_count: AtomicUsize::new(0),
            num_dead_callback: OnceCell::new(),
            needs_cleanup: SharedFlag::new(),
            scheduler,
        };
        log::debug!(target: "objstorage", "{}: created with {}", storage.name, options);
        storage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn options(&self) -> &ObjStorageOptions {
        &self.options
    }

    pub fn scheduler(&self) -> &Arc<CleanupScheduler> {
        &self.scheduler
    }

    /// Number of entries currently allocated.
    pub fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> usize {
        let array = self.obtain_active_array();
        let count = unsafe { array.as_ref().block_count_acquire() };
        self.relinquish_block_array(array);
        count
    }

    pub fn total_memory_usage(&self) -> usize {
        let array = self.obtain_active_array();
        let (blocks, size) = unsafe { (array.as_ref().block_count(), array.as_ref().size()) };
        self.relinquish_block_array(array);
        size_of::<Self>() + blocks * Block::size() + ActiveArray::byte_size(size).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Allocation

    /// The current array. Valid while the allocation mutex is held, since
    /// only holders of that mutex replace the array.
    fn active_array_locked<'a>(&'a self, _state: &'a AllocationState) -> &'a ActiveArray {
        unsafe { &*self.active_array.load(Ordering::Relaxed) }
    }

    /// Allocates an entry. The new entry is null. Returns `None` if no block
    /// with free entries exists and a new one could not be created.
    pub fn allocate(&self) -> Option<NonNull<Slot>> {
        let mut state = self.allocation.lock();
        let block = match self.block_for_allocation(&mut state) {
            Some(block) => block,
            None => return None,
        };
        let block_ref = unsafe { block.as_ref() };
        debug_assert!(!block_ref.is_full(), "invariant");
        if block_ref.is_empty() {
            log::trace!(target: "objstorage-blocks", "{}: block not empty {:p}", self.name, block);
        }
        let result = block_ref.allocate();
        debug_assert!(!block_ref.is_empty(), "postcondition");
        if block_ref.is_full() {
            // Full blocks are not considered by future allocations.
            log::trace!(target: "objstorage-blocks", "{}: block full {:p}", self.name, block);
            state.list.unlink(block.as_ptr());
        }
        drop(state);

        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        log::trace!(target: "objstorage-ref", "{}: allocated {:p}", self.name, result);
        Some(result)
    }

    /// Allocates up to `n` entries (at most [`BULK_ALLOCATE_LIMIT`]) from a
    /// single block and appends them to `out`. Returns the number allocated;
    /// 0 means allocation failed.
    pub fn allocate_bulk(&self, n: usize, out: &mut Vec<NonNull<Slot>>) -> usize {
        if n == 0 {
            return 0;
        }

        let (block, mut taken) = {
            let mut state = self.allocation.lock();
            let block = match self.block_for_allocation(&mut state) {
                Some(block) => block,
                None => return 0,
            };
            // Taking all remaining entries, so remove from the list.
            state.list.unlink(block.as_ptr());
            let block_ref = unsafe { block.as_ref() };
            if block_ref.is_empty() {
                log::trace!(target: "objstorage-blocks", "{}: block not empty {:p}", self.name, block);
            }
            let taken = block_ref.allocate_all();
            debug_assert!(!is_empty_bitmask(taken), "invariant");
            (block, taken)
        };
        let block_ref = unsafe { block.as_ref() };

        let num_taken = population_count(taken);
        self.allocation_count.fetch_add(num_taken, Ordering::Relaxed);

        let limit = num_taken.min(n);
        out.reserve(limit);
        for _ in 0..limit {
            debug_assert!(taken != 0, "invariant");
            let index = taken.trailing_zeros() as usize;
            taken ^= block_ref.bitmask_for_index(index);
            out.push(block_ref.slot_ptr(index));
        }

        // Hand back whatever was claimed but not asked for.
        if taken != 0 {
            debug_assert_eq!(num_taken, limit + population_count(taken), "invariant");
            block_ref.release_entries(taken, self);
            self.allocation_count.fetch_sub(num_taken - limit, Ordering::Relaxed);
        }
        log::trace!(
            target: "objstorage-ref",
            "{}: bulk allocate {}, returned {}",
            self.name,
            limit,
            num_taken - limit
        );
        limit
    }

    fn block_for_allocation(&self, state: &mut MutexGuard<'_, AllocationState>) -> Option<NonNull<Block>> {
        loop {
            if let Some(block) = NonNull::new(state.list.head()) {
                return Some(block);
            } else if self.reduce_deferred_updates(state) {
                // Might have added a block to the list, so retry.
            } else if self.try_add_block(state) {
                debug_assert!(!state.list.is_empty(), "invariant");
            } else if !state.list.is_empty() {
                // Adding failed, but another thread added a block while the
                // mutex was released for the allocation.
            } else if !self.reduce_deferred_updates(state) {
                log::info!(target: "objstorage-blocks", "{}: failed block allocation", self.name);
                return None;
            }
        }
    }

    /// Creates a block and registers it. The allocation mutex is released
    /// while the block's memory is allocated.
    fn try_add_block(&self, state: &mut MutexGuard<'_, AllocationState>) -> bool {
        let id = self.id;
        let block = match MutexGuard::unlocked(state, || Block::new(id)) {
            Some(block) => block,
            None => return false,
        };

        if !self.active_array_locked(state).push(block) {
            if self.expand_active_array(state) {
                let pushed = self.active_array_locked(state).push(block);
                assert!(pushed, "push failed after expansion");
            } else {
                log::debug!(target: "objstorage-blocks", "{}: failed active array expand", self.name);
                unsafe { Block::delete(block) };
                return false;
            }
        }

        // Other threads may have added blocks while the mutex was released.
        // Non-empty blocks are preferred for allocation so empty ones can be
        // deleted, but this one is about to be allocated from anyway.
        state.list.push_back(block.as_ptr());
        let start = unsafe { block.as_ref().slot_ptr(0).as_ptr() as usize };
        state.block_index.insert(start, block);
        log::debug!(target: "objstorage-blocks", "{}: new block {:p}", self.name, block);
        true
    }

    // ------------------------------------------------------------------
    // Active array protocol

    /// Grows the active array to twice its size. Caller holds the
    /// allocation mutex.
    fn expand_active_array(&self, state: &AllocationState) -> bool {
        let old_array = NonNull::from(self.active_array_locked(state));
        let old = unsafe { old_array.as_ref() };
        let new_size = match old.size().checked_mul(2) {
            Some(size) if size <= ObjStorageOptions::MAX_ACTIVE_ARRAY_SIZE => size,
            _ => {
                log::debug!(target: "objstorage-blocks", "{}: active array at maximum size", self.name);
                return false;
            }
        };
        log::debug!(target: "objstorage-blocks", "{}: expand active array {}", self.name, new_size);

        let new_array = match ActiveArray::create(new_size) {
            Some(array) => array,
            None => return false,
        };
        unsafe { new_array.as_ref().copy_from(old) };
        self.replace_active_array(new_array);
        self.relinquish_block_array(old_array);
        true
    }

    /// Publishes `new_array` and waits until no reader can still pick up the
    /// old one. Readers that already did hold a reference, so the caller can
    /// drop its own and the last holder frees the old array.
    fn replace_active_array(&self, new_array: NonNull<ActiveArray>) {
        // The storage's own reference.
        unsafe { new_array.as_ref().increment_refcount() };
        self.active_array.store(new_array.as_ptr(), Ordering::Release);
        GlobalCounter::write_synchronize();
    }

    /// Takes a counted reference to the current array. Lock-free; the
    /// critical section keeps a concurrent replacement from freeing the
    /// array between the load and the increment.
    pub(crate) fn obtain_active_array(&self) -> NonNull<ActiveArray> {
        let _cs = CriticalSection::new();
        let array = self.active_array.load(Ordering::Acquire);
        unsafe {
            (*array).increment_refcount();
            NonNull::new_unchecked(array)
        }
    }

    pub(crate) fn relinquish_block_array(&self, array: NonNull<ActiveArray>) {
        if unsafe { array.as_ref().decrement_refcount() } {
            assert_ne!(
                array.as_ptr(),
                self.active_array.load(Ordering::Relaxed),
                "releasing the current active array"
            );
            unsafe { ActiveArray::destroy(array) };
        }
    }

    // ------------------------------------------------------------------
    // Release

    fn check_release_entry(ptr: NonNull<Slot>) {
        debug_assert!(
            unsafe { ptr.as_ref() }.is_null(),
            "releasing unnulled entry {:p}",
            ptr
        );
    }

    /// Finds the block holding `ptr`. Only meaningful for entries allocated
    /// from this storage.
    unsafe fn find_block(&self, ptr: NonNull<Slot>) -> &Block {
        let block = Block::block_for_ptr(ptr.as_ptr()).as_ref();
        debug_assert_eq!(block.owner(), self.id, "{:p} not owned by {}", ptr, self.name);
        block
    }

    /// Releases an entry. Never blocks.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated from this storage and not released
    /// since, and its value must already be null.
    pub unsafe fn release(&self, ptr: NonNull<Slot>) {
        Self::check_release_entry(ptr);
        let block = self.find_block(ptr);
        log::trace!(target: "objstorage-ref", "{}: releasing {:p}", self.name, ptr);
        block.release_entries(block.bitmask_for_entry(ptr.as_ptr()), self);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Releases a batch of entries. Runs of entries from the same block are
    /// released with a single bitmask update.
    ///
    /// # Safety
    ///
    /// Same as [`release`](Self::release) for each entry; no duplicates.
    pub unsafe fn release_bulk(&self, ptrs: &[NonNull<Slot>]) {
        let mut i = 0;
        while i < ptrs.len() {
            let block = self.find_block(ptrs[i]);
            let mut count = 0;
            let mut releasing = 0usize;
            while i < ptrs.len() {
                let entry = ptrs[i];
                Self::check_release_entry(entry);
                // Entry from another block; finish this one first.
                if !block.contains(entry.as_ptr()) {
                    break;
                }
                log::trace!(target: "objstorage-ref", "{}: releasing {:p}", self.name, entry);
                let entry_bitmask = block.bitmask_for_entry(entry.as_ptr());
                debug_assert_eq!(releasing & entry_bitmask, 0, "duplicate entries");
                releasing |= entry_bitmask;
                count += 1;
                i += 1;
            }
            block.release_entries(releasing, self);
            self.allocation_count.fetch_sub(count, Ordering::Relaxed);
        }
    }

    /// Pops one block off the deferred-update list and makes its allocation
    /// list membership match its current bitmask. Returns false if the list
    /// was empty.
    pub(crate) fn reduce_deferred_updates(&self, state: &mut AllocationState) -> bool {
        // Single consumer: the allocation mutex is held.
        let block = unsafe { self.deferred_updates.pop() };
        if block.is_null() {
            return false;
        }
        let block_ref = unsafe { &*block };
        block_ref.clear_deferred();
        // Order the bitmask read after the claim is cleared. A release that
        // does not see the cleared claim has its bitmask change seen here.
        fence(Ordering::SeqCst);
        let allocated = block_ref.allocated_bitmask();

        if state.list.contains(block) {
            debug_assert!(!is_full_bitmask(allocated), "invariant");
        } else if !is_full_bitmask(allocated) {
            state.list.push_front(block);
        }

        // Empty blocks go to the back, where deletion looks for them. The
        // release that emptied the block may have found it already queued
        // and left the cleanup request to us.
        if is_empty_bitmask(allocated) {
            state.list.unlink(block);
            state.list.push_back(block);
            self.record_needs_cleanup();
        }

        log::trace!(
            target: "objstorage-blocks",
            "{}: processed deferred update {:p}",
            self.name,
            block
        );
        true
    }

    /// Processes every pending deferred update. Returns how many were
    /// processed.
    pub fn drain_deferred_updates(&self) -> usize {
        let mut state = self.allocation.lock();
        let mut processed = 0;
        while self.reduce_deferred_updates(&mut state) {
            processed += 1;
        }
        processed
    }

    // ------------------------------------------------------------------
    // Status

    /// Classifies an arbitrary address. Never fails on bogus input.
    pub fn allocation_status(&self, ptr: *const Slot) -> EntryStatus {
        let addr = ptr as usize;
        // Holding the mutex keeps blocks from being deleted under us.
        let state = self.allocation.lock();
        let (start, block) = match state.block_index.range(..=addr).next_back() {
            Some((start, block)) => (*start, unsafe { block.as_ref() }),
            None => return EntryStatus::Invalid,
        };
        if !block.contains(ptr) || (addr - start) % size_of::<Slot>() != 0 {
            return EntryStatus::Invalid;
        }
        if block.allocated_bitmask() & block.bitmask_for_entry(ptr) != 0 {
            EntryStatus::Allocated
        } else {
            EntryStatus::Unallocated
        }
    }

    // ------------------------------------------------------------------
    // Iteration

    pub(crate) fn begin_iteration(&self) {
        self.active.lock().iteration_count += 1;
    }

    pub(crate) fn end_iteration(&self, concurrent: bool) {
        let mut active = self.active.lock();
        assert!(active.iteration_count > 0, "invariant");
        active.iteration_count -= 1;
        let suppressed = active.iteration_count == 0 && std::mem::take(&mut active.deletion_suppressed);
        drop(active);
        // Deferred updates may have piled up while deletion was held off.
        if concurrent || suppressed {
            self.record_needs_cleanup();
        }
    }

    /// Serial iteration over every allocated entry. Must be called at a
    /// safepoint. Stops early, returning false, when `f` does.
    pub fn iterate_safepoint<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&Slot) -> bool,
    {
        debug_assert!(safepoint::is_at_safepoint(), "must be at safepoint");
        let state = ParState::new(self, 1, false);
        let array = state.active_array();
        let count = state.block_count();
        for i in 0..count {
            let block = unsafe { array.at(i).as_ref() };
            if !block.iterate(&mut f) {
                return false;
            }
        }
        true
    }

    /// Applies `f` to every allocated entry at a safepoint.
    pub fn oops_do<F>(&self, mut f: F)
    where
        F: FnMut(&Slot),
    {
        self.iterate_safepoint(|slot| {
            f(slot);
            true
        });
    }

    /// Clears entries whose referent is dead and applies `keep_alive` to the
    /// rest. Null entries are skipped. Returns the number of entries cleared;
    /// the caller reports it with [`report_num_dead`](Self::report_num_dead).
    pub fn weak_oops_do<A, K>(&self, mut is_alive: A, mut keep_alive: K) -> usize
    where
        A: FnMut(ObjRef) -> bool,
        K: FnMut(&Slot),
    {
        let mut num_dead = 0;
        self.iterate_safepoint(|slot| {
            if let Some(obj) = slot.load() {
                if is_alive(obj) {
                    keep_alive(slot);
                } else {
                    slot.clear();
                    num_dead += 1;
                }
            }
            true
        });
        num_dead
    }

    /// Registers the function told how many entries a weak pass cleared.
    /// Only one callback is supported.
    pub fn register_num_dead_callback<F>(&self, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let registered = self.num_dead_callback.set(Box::new(f)).is_ok();
        assert!(registered, "{}: only one num dead callback supported", self.name);
    }

    pub fn should_report_num_dead(&self) -> bool {
        self.num_dead_callback.get().is_some()
    }

    pub fn report_num_dead(&self, num_dead: usize) {
        if let Some(callback) = self.num_dead_callback.get() {
            callback(num_dead);
        }
    }

    // ------------------------------------------------------------------
    // Cleanup

    /// Marks this storage as having cleanup work and tells the scheduler.
    pub(crate) fn record_needs_cleanup(&self) {
        // Local flag first, else the reclaiming thread could wake up and
        // miss the request.
        self.needs_cleanup.set();
        self.scheduler.request_cleanup();
    }

    pub fn needs_cleanup(&self) -> bool {
        self.needs_cleanup.is_set()
    }

    /// Processes deferred updates and deletes empty blocks from the tail of
    /// the allocation list. Does a bounded amount of work per call and
    /// returns true if more may remain, in which case the caller should call
    /// again later.
    pub fn delete_empty_blocks(&self) -> bool {
        // Nothing requested for this storage, but pending deferred updates
        // may still turn up empty blocks.
        if self.needs_cleanup.is_unset() && self.deferred_updates.is_empty() {
            return false;
        }

        let mut state = self.allocation.lock();
        // Clear the request before processing.
        self.needs_cleanup.unset_fence();

        // Other threads can keep adding deferred updates and empty blocks
        // while this runs, so bound the work done per call.
        let limit = self.active_array_locked(&state).block_count() + self.options.delete_slack;

        for _ in 0..limit {
            // Deferred updates may expose more empty blocks; keep checking
            // once deletion has started.
            if self.reduce_deferred_updates(&mut state) {
                MutexGuard::unlocked(&mut state, safepoint::wait_gc);
                continue;
            }

            let block = state.list.tail();
            if block.is_null() || !unsafe { (*block).is_empty() } {
                return false;
            } else if !unsafe { (*block).is_safe_to_delete() } {
                // Try again later.
                break;
            }

            let block = unsafe { NonNull::new_unchecked(block) };
            {
                let mut active = self.active.lock();
                // Never pull a block out from under an iteration. The last
                // iteration to finish asks for cleanup again.
                if active.iteration_count > 0 {
                    active.deletion_suppressed = true;
                    return false;
                }
                self.active_array_locked(&state).remove(block);
            }
            state.list.unlink(block.as_ptr());
            let start = unsafe { block.as_ref().slot_ptr(0).as_ptr() as usize };
            state.block_index.remove(&start);

            MutexGuard::unlocked(&mut state, || {
                log::debug!(target: "objstorage-blocks", "{}: delete empty block {:p}", self.name, block);
                unsafe { Block::delete(block) };
                safepoint::wait_gc();
            });
        }

        // Ran out of budget, or the tail block is still busy.
        self.record_needs_cleanup();
        true
    }

    /// Checks the structural invariants. Expects no concurrent allocation,
    /// release or iteration, and drains deferred updates first.
    pub fn verify(&self) {
        let mut state = self.allocation.lock();
        while self.reduce_deferred_updates(&mut state) {}

        let array = self.active_array_locked(&state);
        let mut allocated = 0;
        for i in 0..array.block_count() {
            let block = unsafe { array.at(i).as_ref() };
            assert_eq!(block.active_index(), i, "{}: wrong active index", self.name);
            assert_eq!(block.owner(), self.id, "{}: foreign block", self.name);
            assert!(!block.is_deferred(), "{}: block still deferred", self.name);
            let listed = state.list.contains(block as *const Block as *mut Block);
            assert_eq!(listed, !block.is_full(), "{}: list membership of {:?}", self.name, block);
            allocated += population_count(block.allocated_bitmask());
        }
        assert_eq!(allocated, self.allocation_count(), "{}: allocation count", self.name);
        assert_eq!(state.block_index.len(), array.block_count(), "{}: block index", self.name);

        // Once the first empty block is seen, every later one is empty.
        let mut seen_empty = false;
        let mut listed = 0;
        for block in state.list.iter() {
            let empty = unsafe { (*block).is_empty() };
            assert!(!seen_empty || empty, "{}: empty block before non-empty", self.name);
            seen_empty |= empty;
            listed += 1;
        }
        assert!(listed <= array.block_count());
    }
}

impl fmt::Display for ObjStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocations = self.allocation_count();
        let blocks = self.block_count();
        write!(
            f,
            "{}: {} entries in {} blocks ({:.0}%), {}",
            self.name,
            allocations,
            blocks,
            percent_of(allocations, blocks * BULK_ALLOCATE_LIMIT),
            formatted_size(self.total_memory_usage())
        )
    }
}

impl fmt::Debug for ObjStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjStorage")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("allocation_count", &self.allocation_count())
            .field("block_count", &self.block_count())
            .finish()
    }
}

impl Drop for ObjStorage {
    fn drop(&mut self) {
        unsafe {
            loop {
                let block = self.deferred_updates.pop();
                if block.is_null() {
                    break;
                }
                (*block).clear_deferred();
            }

            let state = self.allocation.get_mut();
            loop {
                let head = state.list.head();
                if head.is_null() {
                    break;
                }
                state.list.unlink(head);
            }
            state.block_index.clear();

            let array = NonNull::new_unchecked(*self.active_array.get_mut());
            let unreferenced = array.as_ref().decrement_refcount();
            assert!(unreferenced, "deleting storage while active array is referenced");
            for i in (0..array.as_ref().block_count()).rev() {
                Block::delete(array.as_ref().at(i));
            }
            ActiveArray::destroy(array);
        }
        log::debug!(target: "objstorage", "{}: deleted", self.name);
    }
}

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::active_array::ActiveArray;
use super::slot::{ObjRef, Slot};
use super::ObjStorage;
use crate::base::percent_of;
use crate::safepoint;

/// Per-worker claim state for a [`ParState`].
#[derive(Debug, Default, Clone, Copy)]
pub struct IterationData {
    pub segment_start: usize,
    pub segment_end: usize,
    pub processed: usize,
}

/// Shared state for one parallel iteration over a storage.
///
/// Any number of workers share a `ParState` and claim disjoint segments of
/// the active array snapshot taken at construction. Blocks added after that
/// are not visited. While any `ParState` is alive, the storage will not
/// delete empty blocks.
///
/// A concurrent iteration may run alongside allocation and release, so a
/// visitor can see an entry that is being released or has been nulled. A
/// non-concurrent one must run at a safepoint.
pub struct ParState<'a> {
    storage: &'a ObjStorage,
    active_array: NonNull<ActiveArray>,
    block_count: usize,
    next_block: AtomicUsize,
    estimated_thread_count: usize,
    concurrent: bool,
    num_dead: AtomicUsize,
}

unsafe impl Send for ParState<'_> {}
unsafe impl Sync for ParState<'_> {}

/// Upper bound on blocks claimed at once, to spread the tail of the work.
const MAX_CLAIM: usize = 10;

impl<'a> ParState<'a> {
    pub fn new(storage: &'a ObjStorage, estimated_thread_count: usize, concurrent: bool) -> Self {
        assert!(estimated_thread_count > 0, "estimated thread count must be positive");
        debug_assert!(
            concurrent || safepoint::is_at_safepoint(),
            "non-concurrent iteration outside safepoint"
        );
        // Register before taking the snapshot, so no block in it can be
        // deleted while the iteration runs.
        storage.begin_iteration();
        let active_array = storage.obtain_active_array();
        let block_count = unsafe { active_array.as_ref().block_count_acquire() };
        Self {
            storage,
            active_array,
            block_count,
            next_block: AtomicUsize::new(0),
            estimated_thread_count,
            concurrent,
            num_dead: AtomicUsize::new(0),
        }
    }

    pub fn default_estimated_thread_count(concurrent: bool) -> usize {
        let cpus = num_cpus::get();
        if concurrent {
            ((cpus + 3) / 4).max(1)
        } else {
            cpus.max(1)
        }
    }

    pub fn storage(&self) -> &'a ObjStorage {
        self.storage
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    /// Blocks in the snapshot.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub(crate) fn active_array(&self) -> &ActiveArray {
        unsafe { self.active_array.as_ref() }
    }

    /// Claims the next run of blocks into `data`. Returns false once every
    /// block has been claimed.
    pub fn claim_next_segment(&self, data: &mut IterationData) -> bool {
        data.processed += data.segment_end - data.segment_start;
        let mut start = self.next_block.load(Ordering::Relaxed);
        if start >= self.block_count {
            return self.finish_iteration(data);
        }
        // Claim a share of the remaining blocks. Large steps early cut
        // contention; small ones at the end balance the load.
        let max_step = MAX_CLAIM;
        let remaining = self.block_count - start;
        let step = max_step.min(1 + remaining / self.estimated_thread_count);
        // Racing claims may push next_block past the end; clamp.
        start = self.next_block.fetch_add(step, Ordering::Relaxed);
        if start < self.block_count {
            data.segment_start = start;
            data.segment_end = (start + step).min(self.block_count);
            true
        } else {
            self.finish_iteration(data)
        }
    }

    /// Clears the spent segment so later calls add nothing to `processed`.
    fn finish_iteration(&self, data: &mut IterationData) -> bool {
        data.segment_start = 0;
        data.segment_end = 0;
        log::info!(
            target: "objstorage-stats",
            "Parallel iteration on {}: blocks = {}, processed = {} ({:2.0}%)",
            self.storage.name(),
            self.block_count,
            data.processed,
            percent_of(data.processed, self.block_count)
        );
        false
    }

    /// Applies `f` to every allocated entry in the segments this worker
    /// claims. Call from each worker with its own `f`.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&Slot),
    {
        let array = self.active_array();
        let mut data = IterationData::default();
        while self.claim_next_segment(&mut data) {
            for i in data.segment_start..data.segment_end {
                let block = unsafe { array.at(i).as_ref() };
                block.iterate(|slot| {
                    f(slot);
                    true
                });
            }
        }
    }

    pub fn oops_do<F>(&self, f: F)
    where
        F: FnMut(&Slot),
    {
        self.iterate(f)
    }

    /// Clears entries whose referent is dead, applies `keep_alive` to the
    /// rest, and adds the cleared count to this iteration's total.
    pub fn weak_oops_do<A, K>(&self, mut is_alive: A, mut keep_alive: K)
    where
        A: FnMut(ObjRef) -> bool,
        K: FnMut(&Slot),
    {
        let mut num_dead = 0;
        self.iterate(|slot| {
            if let Some(obj) = slot.load() {
                if is_alive(obj) {
                    keep_alive(slot);
                } else {
                    slot.clear();
                    num_dead += 1;
                }
            }
        });
        self.increment_num_dead(num_dead);
    }

    pub fn increment_num_dead(&self, num_dead: usize) {
        self.num_dead.fetch_add(num_dead, Ordering::Relaxed);
    }

    pub fn num_dead(&self) -> usize {
        self.num_dead.load(Ordering::Relaxed)
    }

    pub fn report_num_dead(&self) {
        self.storage.report_num_dead(self.num_dead());
    }
}

impl Drop for ParState<'_> {
    fn drop(&mut self) {
        self.storage.relinquish_block_array(self.active_array);
        self.storage.end_iteration(self.is_concurrent());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ObjStorageOptions;
    use crate::safepoint::SafepointScope;
    use crate::storage::block::BULK_ALLOCATE_LIMIT;
    use crate::storage::cleanup::CleanupScheduler;
    use scoped_thread_pool::Pool;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn storage(name: &str) -> ObjStorage {
        let _ = env_logger::builder().is_test(true).try_init();
        ObjStorage::with_scheduler(
            name,
            ObjStorageOptions::default(),
            Arc::new(CleanupScheduler::new(Duration::ZERO)),
        )
    }

    fn fill(storage: &ObjStorage, n: usize) -> Vec<NonNull<Slot>> {
        let mut slots = Vec::with_capacity(n);
        while slots.len() < n {
            let want = n - slots.len();
            assert!(storage.allocate_bulk(want, &mut slots) > 0);
        }
        slots
    }

    #[test]
    fn test_segments_cover_snapshot_once() {
        let storage = storage("segments");
        let slots = fill(&storage, 40 * BULK_ALLOCATE_LIMIT);
        let state = ParState::new(&storage, 3, true);
        assert!(state.is_concurrent());
        assert_eq!(state.block_count(), 40);

        let mut claimed = vec![];
        let mut data = IterationData::default();
        while state.claim_next_segment(&mut data) {
            assert!(data.segment_start < data.segment_end);
            assert!(data.segment_end - data.segment_start <= MAX_CLAIM);
            claimed.extend(data.segment_start..data.segment_end);
        }
        assert_eq!(data.processed, 40);
        assert_eq!(claimed, (0..40).collect::<Vec<_>>());
        // Exhausted claims stay exhausted and count nothing twice.
        assert!(!state.claim_next_segment(&mut data));
        assert!(!state.claim_next_segment(&mut data));
        assert_eq!(data.processed, 40);
        assert_eq!(data.segment_start, data.segment_end);
        drop(state);

        unsafe { storage.release_bulk(&slots) };
    }

    #[test]
    fn test_parallel_iterate_visits_every_entry() {
        let storage = storage("parallel");
        let slots = fill(&storage, 2000);
        let expected: HashSet<usize> = slots.iter().map(|s| s.as_ptr() as usize).collect();

        let workers = 4;
        let state = ParState::new(&storage, workers, true);
        let seen = parking_lot::Mutex::new(Vec::new());
        let pool = Pool::new(workers);
        pool.scoped(|scope| {
            for _ in 0..workers {
                let state = &state;
                let seen = &seen;
                scope.execute(move || {
                    let mut local = vec![];
                    state.iterate(|slot| local.push(slot as *const Slot as usize));
                    seen.lock().extend(local);
                });
            }
        });
        pool.shutdown();
        drop(state);

        let seen = seen.into_inner();
        assert_eq!(seen.len(), expected.len(), "entry visited twice or missed");
        assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);

        unsafe { storage.release_bulk(&slots) };
    }

    #[test]
    fn test_weak_oops_do_clears_dead() {
        let storage = storage("weak-par");
        let reported = Arc::new(AtomicUsize::new(usize::MAX));
        {
            let reported = reported.clone();
            storage.register_num_dead_callback(move |n| reported.store(n, Ordering::Relaxed));
        }

        let slots = fill(&storage, 100);
        for (i, slot) in slots.iter().enumerate() {
            let value = if i % 10 == 0 { None } else { NonNull::new((i * 8) as *mut u8) };
            unsafe { slot.as_ref().store(value) };
        }

        let _safepoint = SafepointScope::new();
        let state = ParState::new(&storage, 2, false);
        assert!(!state.is_concurrent());
        let mut kept = 0;
        // Odd multiples of 8 are dead.
        state.weak_oops_do(|obj| (obj.as_ptr() as usize / 8) % 2 == 0, |_| kept += 1);
        state.report_num_dead();
        assert_eq!(state.num_dead(), 50);
        assert_eq!(kept, 40);
        assert_eq!(reported.load(Ordering::Relaxed), 50);
        drop(state);

        for slot in &slots {
            unsafe { slot.as_ref().clear() };
        }
        unsafe { storage.release_bulk(&slots) };
    }

    #[test]
    fn test_iteration_holds_off_deletion() {
        let storage = storage("holdoff");
        let slots = fill(&storage, 3 * BULK_ALLOCATE_LIMIT);
        unsafe { storage.release_bulk(&slots) };
        assert_eq!(storage.block_count(), 3);

        let state = ParState::new(&storage, 1, true);
        storage.delete_empty_blocks();
        assert_eq!(storage.block_count(), 3);
        state.iterate(|_| panic!("no entries are allocated"));
        drop(state);

        assert!(storage.needs_cleanup());
        while storage.delete_empty_blocks() {}
        assert_eq!(storage.block_count(), 0);
    }
}

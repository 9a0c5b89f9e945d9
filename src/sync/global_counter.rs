//! The GlobalCounter provides a synchronization mechanism between threads for
//! safe memory reclamation and other ABA problems. All readers must call
//! critical_section_begin before reading the shared data and
//! critical_section_end afterwards. Such read-side critical sections may
//! be properly nested. The write side must call write_synchronize
//! before reclaiming the memory. The read path only does an uncontended store
//! to a thread-local counter and a fence to stop any loads from floating up,
//! thus light weight and wait-free. The write side is heavier since it must
//! check all readers and wait until they have left the generation.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot_core::SpinWait;
use thread_local::ThreadLocal;

const COUNTER_ACTIVE: usize = 1;
const COUNTER_INCREMENT: usize = 2;

static GLOBAL_COUNTER: AtomicUsize = AtomicUsize::new(COUNTER_INCREMENT);
static THREAD_COUNTERS: Lazy<ThreadLocal<AtomicUsize>> = Lazy::new(ThreadLocal::new);

/// Value of the thread's counter before the section was entered; restoring
/// it on exit is what makes nesting work.
#[derive(Clone, Copy, Debug)]
#[must_use]
pub struct CsContext(usize);

pub struct GlobalCounter;

impl GlobalCounter {
    fn thread_counter() -> &'static AtomicUsize {
        THREAD_COUNTERS.get_or(|| AtomicUsize::new(0))
    }

    pub fn critical_section_begin() -> CsContext {
        let counter = Self::thread_counter();
        let old = counter.load(Ordering::Relaxed);
        // Nested sections keep the generation of the outermost one.
        if old & COUNTER_ACTIVE == 0 {
            let new = GLOBAL_COUNTER.load(Ordering::Relaxed) | COUNTER_ACTIVE;
            counter.store(new, Ordering::Relaxed);
            fence(Ordering::SeqCst);
        }
        CsContext(old)
    }

    pub fn critical_section_end(context: CsContext) {
        let counter = Self::thread_counter();
        debug_assert!(
            counter.load(Ordering::Relaxed) & COUNTER_ACTIVE != 0,
            "critical section end without begin"
        );
        counter.store(context.0, Ordering::Release);
    }

    /// Blocks until every reader that was inside a critical section when this
    /// was called has left it.
    pub fn write_synchronize() {
        let generation = GLOBAL_COUNTER
            .fetch_add(COUNTER_INCREMENT, Ordering::SeqCst)
            .wrapping_add(COUNTER_INCREMENT);

        for counter in THREAD_COUNTERS.iter() {
            let mut spin = SpinWait::new();
            loop {
                let value = counter.load(Ordering::Acquire);
                // Readers that entered in this generation or later cannot
                // have observed what the writer is about to reclaim.
                if value & COUNTER_ACTIVE == 0
                    || (value.wrapping_sub(generation) as isize) >= 0
                {
                    break;
                }
                if !spin.spin() {
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// RAII read-side critical section.
pub struct CriticalSection {
    context: CsContext,
    marker: PhantomData<*mut u8>,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self {
            context: GlobalCounter::critical_section_begin(),
            marker: PhantomData,
        }
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        GlobalCounter::critical_section_end(self.context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_write_synchronize_without_readers() {
        GlobalCounter::write_synchronize();
        {
            let _outer = CriticalSection::new();
            let _inner = CriticalSection::new();
        }
        GlobalCounter::write_synchronize();
    }

    #[test]
    fn test_writer_waits_for_reader() {
        let barrier = Arc::new(Barrier::new(2));
        let released = Arc::new(AtomicBool::new(false));

        let reader = {
            let barrier = barrier.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                let cs = CriticalSection::new();
                barrier.wait();
                std::thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                drop(cs);
            })
        };

        barrier.wait();
        GlobalCounter::write_synchronize();
        assert!(released.load(Ordering::SeqCst));
        reader.join().unwrap();
    }
}

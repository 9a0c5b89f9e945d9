//! Background thread that deletes empty blocks from registered storages.
//!
//! The thread sleeps on the cleanup scheduler. When woken with pending work
//! it runs one bounded pass over the storage set; a storage that still has
//! work after its pass re-requests cleanup, so the next pass comes after the
//! scheduler's defer period instead of immediately.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::storage::cleanup::CleanupScheduler;
use crate::storage::StorageSet;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ServiceState {
    storages: Arc<StorageSet>,
    scheduler: Arc<CleanupScheduler>,
    poll_interval: Duration,
    should_terminate: AtomicBool,
    cleanup_passes: AtomicUsize,
}

impl ServiceState {
    fn run(&self) {
        log::debug!(target: "objstorage", "service thread started");
        while !self.should_terminate.load(Ordering::Acquire) {
            if !self.scheduler.wait_for_trigger(self.poll_interval) {
                // Nobody triggered us; check whether a request is due.
                self.scheduler.trigger_cleanup_if_needed();
                continue;
            }
            if self.scheduler.has_cleanup_work_and_reset() {
                self.cleanup();
            }
        }
        log::debug!(target: "objstorage", "service thread terminated");
    }

    fn cleanup(&self) {
        let more_work = self.storages.delete_empty_blocks();
        self.cleanup_passes.fetch_add(1, Ordering::Relaxed);
        if more_work {
            self.scheduler.request_cleanup();
        }
        log::trace!(target: "objstorage", "cleanup pass done, more work: {}", more_work);
    }
}

pub struct ServiceThread {
    state: Arc<ServiceState>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceThread {
    pub fn start(storages: Arc<StorageSet>, scheduler: Arc<CleanupScheduler>) -> io::Result<Self> {
        Self::with_poll_interval(storages, scheduler, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        storages: Arc<StorageSet>,
        scheduler: Arc<CleanupScheduler>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let state = Arc::new(ServiceState {
            storages,
            scheduler,
            poll_interval,
            should_terminate: AtomicBool::new(false),
            cleanup_passes: AtomicUsize::new(0),
        });

        let started = Arc::new((Mutex::new(false), Condvar::new()));
        let handle = {
            let state = state.clone();
            let started = started.clone();
            std::thread::Builder::new()
                .name("objstorage-service".to_string())
                .spawn(move || {
                    {
                        let mut lock = started.0.lock();
                        *lock = true;
                        started.1.notify_one();
                    }
                    state.run();
                })?
        };

        // Wait for the thread to be actually running.
        let mut lock = started.0.lock();
        while !*lock {
            started.1.wait(&mut lock);
        }
        drop(lock);

        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    pub fn storages(&self) -> &Arc<StorageSet> {
        &self.state.storages
    }

    /// Number of cleanup passes run so far.
    pub fn cleanup_passes(&self) -> usize {
        self.state.cleanup_passes.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Asks the thread to exit and waits for it. Idempotent.
    pub fn stop(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };
        self.state.should_terminate.store(true, Ordering::Release);
        self.state.scheduler.wake_all();
        if handle.join().is_err() {
            log::error!(target: "objstorage", "service thread panicked");
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ObjStorageOptions;
    use crate::storage::ObjStorage;
    use std::time::Instant;

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let scheduler = Arc::new(CleanupScheduler::new(Duration::ZERO));
        let mut thread = ServiceThread::with_poll_interval(
            Arc::new(StorageSet::new()),
            scheduler,
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(thread.is_running());

        let start = Instant::now();
        thread.stop();
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(!thread.is_running());
        thread.stop();
        assert_eq!(thread.cleanup_passes(), 0);
    }

    #[test]
    fn test_reclaims_empty_blocks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let scheduler = Arc::new(CleanupScheduler::new(Duration::from_millis(1)));
        let set = Arc::new(StorageSet::new());
        let storage = Arc::new(ObjStorage::with_scheduler(
            "service",
            ObjStorageOptions::default(),
            scheduler.clone(),
        ));
        set.add_weak(storage.clone());

        let mut thread =
            ServiceThread::with_poll_interval(set, scheduler, Duration::from_millis(5)).unwrap();

        let mut slots = vec![];
        while slots.len() < 500 {
            assert!(storage.allocate_bulk(500 - slots.len(), &mut slots) > 0);
        }
        assert!(storage.block_count() > 0);
        unsafe { storage.release_bulk(&slots) };

        let start = Instant::now();
        while storage.block_count() > 0 {
            assert!(start.elapsed() < Duration::from_secs(30), "blocks never reclaimed");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(thread.cleanup_passes() > 0);
        thread.stop();
    }
}

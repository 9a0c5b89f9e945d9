//! Process-wide safepoint flag.
//!
//! A collector calls [`enter`] before touching storage in ways that require
//! all mutators to be in a consistent state (serial iteration, non-concurrent
//! parallel iteration) and [`end`] afterwards. Background work that must not
//! overlap a safepoint polls with [`wait_gc`].

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

static SAFEPOINT_LOCK: Mutex<Option<ThreadId>> = parking_lot::const_mutex(None);
static SAFEPOINT_COND: Condvar = Condvar::new();
static GC_RUNNING: AtomicBool = AtomicBool::new(false);

/// Tries to begin a safepoint owned by the current thread.
///
/// Returns false if some other thread already owns one; in that case this
/// waits for it to end before returning.
pub fn enter() -> bool {
    let current = std::thread::current().id();
    let mut owner = SAFEPOINT_LOCK.lock();

    match *owner {
        None => {
            *owner = Some(current);
            GC_RUNNING.store(true, Ordering::Release);
            log::debug!(target: "safepoint", "{:?} began safepoint", current);
            true
        }
        Some(other) => {
            assert_ne!(other, current, "safepoint is not reentrant");
            // Only one thread may run the safepoint operation; the rest wait
            // for it to finish and then retry if they still need one.
            while owner.is_some() {
                SAFEPOINT_COND.wait(&mut owner);
            }
            false
        }
    }
}

pub fn end() {
    let mut owner = SAFEPOINT_LOCK.lock();
    assert_eq!(
        *owner,
        Some(std::thread::current().id()),
        "safepoint ended by a thread that does not own it"
    );
    *owner = None;
    GC_RUNNING.store(false, Ordering::Release);
    drop(owner);
    SAFEPOINT_COND.notify_all();
    log::debug!(target: "safepoint", "{:?} ended safepoint", std::thread::current().id());
}

pub fn is_at_safepoint() -> bool {
    GC_RUNNING.load(Ordering::Acquire)
}

/// Blocks while a safepoint owned by another thread is in progress.
pub fn wait_gc() {
    if !GC_RUNNING.load(Ordering::Acquire) {
        return;
    }

    let current = std::thread::current().id();
    let mut owner = SAFEPOINT_LOCK.lock();
    while matches!(*owner, Some(other) if other != current) {
        SAFEPOINT_COND.wait(&mut owner);
    }
}

/// Owns a safepoint for the lifetime of the value.
pub struct SafepointScope {
    _private: (),
}

impl SafepointScope {
    pub fn new() -> Self {
        while !enter() {}
        Self { _private: () }
    }
}

impl Default for SafepointScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SafepointScope {
    fn drop(&mut self) {
        end();
    }
}

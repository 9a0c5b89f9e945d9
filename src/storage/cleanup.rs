//! Debounced hand-off of empty block cleanup from storages to the thread
//! that reclaims them.
//!
//! Storages record requests with [`CleanupScheduler::request_cleanup`] from
//! release paths, which must never block. Something periodic (a collector
//! finishing a cycle, or the service thread's own poll) calls
//! [`CleanupScheduler::trigger_cleanup_if_needed`], which wakes the
//! reclaiming thread at most once per defer period. The reclaiming thread
//! consumes the request with [`CleanupScheduler::has_cleanup_work_and_reset`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::base::utils::read_millis_from_env;
use crate::sync::SharedFlag;

pub const DEFAULT_DEFER_PERIOD: Duration = Duration::from_millis(500);

static GLOBAL_SCHEDULER: Lazy<Arc<CleanupScheduler>> = Lazy::new(|| {
    let period = read_millis_from_env("OBJSTORAGE_CLEANUP_DEFER_MS").unwrap_or(DEFAULT_DEFER_PERIOD);
    Arc::new(CleanupScheduler::new(period))
});

struct TriggerState {
    triggered: bool,
    permit_time: Option<Instant>,
}

pub struct CleanupScheduler {
    requested: SharedFlag,
    state: Mutex<TriggerState>,
    cond: Condvar,
    defer_period: Duration,
}

impl CleanupScheduler {
    pub fn new(defer_period: Duration) -> Self {
        Self {
            requested: SharedFlag::new(),
            state: Mutex::new(TriggerState {
                triggered: false,
                permit_time: None,
            }),
            cond: Condvar::new(),
            defer_period,
        }
    }

    /// Scheduler shared by storages created without an explicit one.
    pub fn global() -> Arc<CleanupScheduler> {
        GLOBAL_SCHEDULER.clone()
    }

    pub fn defer_period(&self) -> Duration {
        self.defer_period
    }

    /// Lock-free; callable from release paths.
    pub fn request_cleanup(&self) {
        self.requested.set_fence();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_set()
    }

    /// Wakes the reclaiming thread if cleanup was requested, it has not
    /// been woken yet, and the defer period since the last reset has
    /// passed. Returns whether a notification was sent.
    pub fn trigger_cleanup_if_needed(&self) -> bool {
        let mut state = self.state.lock();
        let permitted = state
            .permit_time
            .map_or(true, |permit_time| Instant::now() > permit_time);
        if self.requested.is_set() && !state.triggered && permitted {
            state.triggered = true;
            drop(state);
            self.cond.notify_all();
            log::trace!(target: "objstorage", "cleanup triggered");
            true
        } else {
            false
        }
    }

    /// Consumes a pending request. Resets the trigger and starts a new defer
    /// period, so the next notification comes no sooner than that.
    pub fn has_cleanup_work_and_reset(&self) -> bool {
        let mut state = self.state.lock();
        state.permit_time = Some(Instant::now() + self.defer_period);
        state.triggered = false;
        self.requested.take()
    }

    /// Waits until triggered or until `timeout` elapses. Returns whether
    /// the trigger is set.
    pub fn wait_for_trigger(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.triggered {
            self.cond.wait_for(&mut state, timeout);
        }
        state.triggered
    }

    /// Wakes every waiter without touching the trigger.
    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for CleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler")
            .field("requested", &self.requested.is_set())
            .field("defer_period", &self.defer_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_trigger_without_request() {
        let scheduler = CleanupScheduler::new(Duration::from_millis(10));
        assert!(!scheduler.trigger_cleanup_if_needed());
        assert!(!scheduler.has_cleanup_work_and_reset());
    }

    #[test]
    fn test_trigger_is_debounced() {
        let scheduler = CleanupScheduler::new(Duration::from_millis(200));
        scheduler.request_cleanup();
        assert!(scheduler.trigger_cleanup_if_needed());
        // Already triggered and not yet consumed.
        assert!(!scheduler.trigger_cleanup_if_needed());
        assert!(scheduler.wait_for_trigger(Duration::from_millis(1)));

        assert!(scheduler.has_cleanup_work_and_reset());
        assert!(!scheduler.is_requested());

        // A new request inside the defer period does not notify.
        scheduler.request_cleanup();
        assert!(!scheduler.trigger_cleanup_if_needed());
        std::thread::sleep(Duration::from_millis(250));
        assert!(scheduler.trigger_cleanup_if_needed());
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let scheduler = Arc::new(CleanupScheduler::new(Duration::ZERO));
        let waiter = {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                while !scheduler.wait_for_trigger(Duration::from_millis(50)) {
                    assert!(start.elapsed() < Duration::from_secs(10));
                }
                scheduler.has_cleanup_work_and_reset()
            })
        };
        scheduler.request_cleanup();
        scheduler.trigger_cleanup_if_needed();
        assert!(waiter.join().unwrap());
    }
}

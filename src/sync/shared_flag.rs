use std::sync::atomic::{AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// Boolean flag shared between threads, published with release/acquire.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    /// Sets the flag with a trailing full fence, so the store is ordered
    /// before any later load by this thread.
    pub fn set_fence(&self) {
        self.0.store(1, Ordering::SeqCst);
    }

    pub fn unset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn unset_fence(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn is_unset(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn set_cond(&self, c: bool) {
        if c {
            self.set();
        } else {
            self.unset();
        }
    }

    /// Returns true if this call changed the flag from unset to set.
    pub fn try_set(&self) -> bool {
        if self.is_set() {
            return false;
        }

        self.0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Returns true if this call changed the flag from set to unset.
    pub fn try_unset(&self) -> bool {
        if self.is_unset() {
            return false;
        }

        self.0
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Unsets the flag and returns whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(0, Ordering::AcqRel) == 1
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedFlag({})", self.is_set())
    }
}

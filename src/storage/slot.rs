use std::ptr::NonNull;

use atomic::{Atomic, Ordering};

/// Reference to an object in the managed heap. The storage never looks at
/// what it points to.
pub type ObjRef = NonNull<u8>;

/// One storage location holding a managed reference or null.
#[repr(transparent)]
pub struct Slot {
    value: Atomic<Option<ObjRef>>,
}

unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    pub const fn null() -> Self {
        Self {
            value: Atomic::new(None),
        }
    }

    #[inline]
    pub fn load(&self) -> Option<ObjRef> {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load_acquire(&self) -> Option<ObjRef> {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, value: Option<ObjRef>) {
        self.value.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn store_release(&self, value: Option<ObjRef>) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, value: Option<ObjRef>) -> Option<ObjRef> {
        self.value.swap(value, Ordering::AcqRel)
    }

    #[inline]
    pub fn clear(&self) {
        self.store(None);
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.load().is_none()
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.load() {
            Some(obj) => write!(f, "Slot({:p})", obj),
            None => write!(f, "Slot(null)"),
        }
    }
}

/// Result of probing an arbitrary address with
/// [`ObjStorage::allocation_status`](super::ObjStorage::allocation_status).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum EntryStatus {
    Invalid,
    Unallocated,
    Allocated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn obj(addr: usize) -> ObjRef {
        NonNull::new(addr as *mut u8).unwrap()
    }

    #[test]
    fn test_swap_returns_previous() {
        let slot = Slot::default();
        assert!(slot.is_null());
        assert_eq!(slot.swap(Some(obj(8))), None);
        assert_eq!(slot.swap(Some(obj(16))), Some(obj(8)));
        assert_eq!(format!("{:?}", Slot::null()), "Slot(null)");
        slot.clear();
        assert!(slot.is_null());
    }

    #[test]
    fn test_release_store_publishes_to_acquire_load() {
        let slot = Slot::null();
        let payload = Slot::null();
        let ready = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                payload.store(Some(obj(0x100)));
                slot.store_release(Some(obj(0x200)));
                ready.store(true, std::sync::atomic::Ordering::Relaxed);
            });
            scope.spawn(|| {
                while slot.load_acquire().is_none() {
                    std::hint::spin_loop();
                }
                assert_eq!(payload.load(), Some(obj(0x100)));
            });
        });
        assert!(ready.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(slot.load_acquire(), Some(obj(0x200)));
        slot.store_release(None);
        assert!(slot.is_null());
    }
}

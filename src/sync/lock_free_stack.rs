use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

/// An item that can be linked into a [`LockFreeStack`] through an embedded
/// next pointer.
pub trait LockFreeItem: Sized {
    fn next_ptr(&self) -> &AtomicPtr<Self>;
}

/// Intrusive Treiber stack. Any number of threads may push concurrently.
/// Popping is only safe while the caller guarantees a single consumer, which
/// rules out ABA on the top pointer.
pub struct LockFreeStack<T: LockFreeItem> {
    top: AtomicPtr<T>,
}

impl<T: LockFreeItem> LockFreeStack<T> {
    pub const fn new() -> Self {
        Self {
            top: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn top(&self) -> *mut T {
        self.top.load(Ordering::Acquire)
    }

    pub fn next(value: &T) -> *mut T {
        value.next_ptr().load(Ordering::Relaxed)
    }

    pub fn set_next(value: &T, next: *mut T) {
        value.next_ptr().store(next, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// `value` must be valid for as long as it is on the stack and must not
    /// already be on it.
    pub unsafe fn push(&self, value: *mut T) {
        let mut cur = self.top.load(Ordering::Relaxed);
        loop {
            Self::set_next(&*value, cur);
            match self
                .top
                .compare_exchange_weak(cur, value, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(fetched) => cur = fetched,
            }
        }
    }

    /// Pops the top item, or returns null when the stack is empty. The
    /// popped item's next pointer is cleared.
    ///
    /// # Safety
    ///
    /// At most one thread may pop at a time.
    pub unsafe fn pop(&self) -> *mut T {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            if top.is_null() {
                return top;
            }
            let next = Self::next(&*top);
            match self
                .top
                .compare_exchange_weak(top, next, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(fetched) => top = fetched,
            }
        }
        Self::set_next(&*top, core::ptr::null_mut());
        top
    }

    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    /// # Safety
    ///
    /// No concurrent pops; pushes may race and not be counted.
    pub unsafe fn length(&self) -> usize {
        let mut cur = self.top();
        let mut len = 0;
        while !cur.is_null() {
            len += 1;
            cur = Self::next(&*cur);
        }
        len
    }
}

impl<T: LockFreeItem> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::null_mut;

    struct Node {
        value: usize,
        next: AtomicPtr<Node>,
    }

    impl LockFreeItem for Node {
        fn next_ptr(&self) -> &AtomicPtr<Self> {
            &self.next
        }
    }

    fn node(value: usize) -> *mut Node {
        Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(null_mut()),
        }))
    }

    #[test]
    fn test_push_pop_order() {
        let stack = LockFreeStack::<Node>::new();
        assert!(stack.is_empty());
        unsafe {
            for i in 0..4 {
                stack.push(node(i));
            }
            assert_eq!(stack.length(), 4);
            for i in (0..4).rev() {
                let popped = stack.pop();
                assert_eq!((*popped).value, i);
                assert!((*popped).next.load(Ordering::Relaxed).is_null());
                drop(Box::from_raw(popped));
            }
            assert!(stack.pop().is_null());
        }
    }

    #[test]
    fn test_concurrent_push() {
        let stack = LockFreeStack::<Node>::new();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let stack = &stack;
                scope.spawn(move || {
                    for i in 0..100 {
                        unsafe { stack.push(node(t * 100 + i)) };
                    }
                });
            }
        });

        let mut seen = vec![false; 400];
        unsafe {
            loop {
                let popped = stack.pop();
                if popped.is_null() {
                    break;
                }
                assert!(!seen[(*popped).value]);
                seen[(*popped).value] = true;
                drop(Box::from_raw(popped));
            }
        }
        assert!(seen.iter().all(|x| *x));
    }
}

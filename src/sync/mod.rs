pub mod global_counter;
pub mod lock_free_stack;
pub mod shared_flag;

pub use global_counter::{CriticalSection, GlobalCounter};
pub use lock_free_stack::{LockFreeItem, LockFreeStack};
pub use shared_flag::SharedFlag;

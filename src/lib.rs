//! Concurrent storage for off-heap references to garbage collected objects.
//!
//! See [`storage`] for the design. [`StorageSet`] groups storages for the
//! collector, and [`ServiceThread`] reclaims their empty blocks in the
//! background.

pub mod base;
pub mod options;
pub mod safepoint;
pub mod service_thread;
pub mod storage;
pub mod sync;

pub use options::ObjStorageOptions;
pub use service_thread::ServiceThread;
pub use storage::cleanup::CleanupScheduler;
pub use storage::{EntryStatus, IterationData, ObjRef, ObjStorage, ParState, Slot, StorageSet};

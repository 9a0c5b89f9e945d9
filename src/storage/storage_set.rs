use std::sync::Arc;

use parking_lot::RwLock;

use super::ObjStorage;
use crate::options::ObjStorageOptions;

/// The storages known to the collector, by reference strength.
///
/// Strong storages are roots. Entries of weak storages are cleared when
/// their referent dies.
#[derive(Default)]
pub struct StorageSet {
    strong: RwLock<Vec<Arc<ObjStorage>>>,
    weak: RwLock<Vec<Arc<ObjStorage>>>,
}

impl StorageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_strong(&self, storage: Arc<ObjStorage>) {
        log::debug!(target: "objstorage", "registering strong storage {}", storage.name());
        self.strong.write().push(storage);
    }

    pub fn add_weak(&self, storage: Arc<ObjStorage>) {
        log::debug!(target: "objstorage", "registering weak storage {}", storage.name());
        self.weak.write().push(storage);
    }

    pub fn create_strong(&self, name: &str, options: ObjStorageOptions) -> Arc<ObjStorage> {
        let storage = Arc::new(ObjStorage::new(name, options));
        self.add_strong(storage.clone());
        storage
    }

    pub fn create_weak(&self, name: &str, options: ObjStorageOptions) -> Arc<ObjStorage> {
        let storage = Arc::new(ObjStorage::new(name, options));
        self.add_weak(storage.clone());
        storage
    }

    pub fn strong(&self) -> Vec<Arc<ObjStorage>> {
        self.strong.read().clone()
    }

    pub fn weak(&self) -> Vec<Arc<ObjStorage>> {
        self.weak.read().clone()
    }

    pub fn all(&self) -> Vec<Arc<ObjStorage>> {
        let mut all = self.strong();
        all.extend(self.weak());
        all
    }

    pub fn find(&self, name: &str) -> Option<Arc<ObjStorage>> {
        self.all().into_iter().find(|storage| storage.name() == name)
    }

    /// One bounded cleanup pass over every storage. Returns true if any of
    /// them has more work.
    pub fn delete_empty_blocks(&self) -> bool {
        let mut more_work = false;
        for storage in self.all() {
            if storage.delete_empty_blocks() {
                more_work = true;
            }
        }
        more_work
    }

    pub fn total_memory_usage(&self) -> usize {
        self.all().iter().map(|storage| storage.total_memory_usage()).sum()
    }

    pub fn print_on(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        for storage in self.all() {
            writeln!(out, "{}", storage)?;
        }
        Ok(())
    }
}

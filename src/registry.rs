//! Registry of live resources keyed by a per-process handle.
//!
//! Insertion hands back a [`Registration`]; dropping it removes the entry,
//! so every exit path of the owner (including early returns and panics)
//! releases its slot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Handle = u64;

#[derive(Debug)]
pub struct Registry<T> {
    next: AtomicU64,
    entries: Mutex<HashMap<Handle, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, value: T) -> Registration<T> {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(handle, value);
        Registration {
            registry: Arc::clone(self),
            handle,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry, handing each to `f`. Used on shutdown.
    pub fn drain(&self, mut f: impl FnMut(Handle, T)) {
        let entries: Vec<_> = self.entries.lock().drain().collect();
        for (handle, value) in entries {
            f(handle, value);
        }
    }

    fn remove(&self, handle: Handle) -> Option<T> {
        self.entries.lock().remove(&handle)
    }
}

/// Owner's claim on a registry slot.
#[derive(Debug)]
pub struct Registration<T> {
    registry: Arc<Registry<T>>,
    handle: Handle,
}

impl<T> Registration<T> {
    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        self.registry.remove(self.handle);
    }
}

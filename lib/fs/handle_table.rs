//! Handles issued by composition engines.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{FileHandle, FsError};

/// Monotonically increasing handle allocator paired with the per-handle state an engine needs to
/// reach its members' handles.
pub struct HandleTable<T> {
    next_fh: AtomicU64,
    open: scc::HashMap<FileHandle, T>,
}

impl<T: Clone + Send + Sync + 'static> HandleTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            open: scc::HashMap::new(),
        }
    }

    /// Record `state` under a freshly allocated handle.
    #[must_use]
    pub fn insert(&self, state: T) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let _ = self.open.insert_sync(fh, state);
        fh
    }

    /// State recorded for `fh`.
    pub fn get(&self, fh: FileHandle) -> Result<T, FsError> {
        self.open
            .read_sync(&fh, |_, state| state.clone())
            .ok_or(FsError::BadFileHandle(fh))
    }

    /// Forget `fh`, returning its state so the caller can close member handles.
    pub fn remove(&self, fh: FileHandle) -> Result<T, FsError> {
        self.open
            .remove_sync(&fh)
            .map(|(_, state)| state)
            .ok_or(FsError::BadFileHandle(fh))
    }

    /// Number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

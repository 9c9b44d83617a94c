//! The engine-facing store interface.

use crate::StoreError;

/// An event delivered to a watch callback.
///
/// Watches are persistent: the engine re-arms them after every fire and
/// after a session re-establishment. Callbacks run on an engine thread and
/// must stay short; anything non-trivial belongs on the worker pool.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The data (or existence) of a watched key changed.
    Data {
        path: String,
        value: Option<String>,
    },
    /// The child set of a watched key changed.
    Children {
        path: String,
        children: Vec<String>,
    },
}

impl WatchEvent {
    pub fn path(&self) -> &str {
        match self {
            WatchEvent::Data { path, .. } => path,
            WatchEvent::Children { path, .. } => path,
        }
    }
}

pub type WatchCallback = Box<dyn Fn(&WatchEvent) + Send + Sync>;

/// Which side of the distributed RW lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// A held distributed lock, released on drop.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: Box<dyn FnOnce() + Send>) -> Self {
        LockGuard {
            release: Some(release),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Engine interface for the hierarchical key store.
///
/// All values are strings; structured data is JSON-encoded by callers.
/// Paths only ever come from the schema layer.
pub trait Store: Send + Sync {
    /// Read a key, `None` if absent.
    fn read(&self, path: &str) -> Result<Option<String>, StoreError>;

    /// Write a batch of keys, creating missing ones (and parents).
    ///
    /// The in-memory engine applies the batch atomically; the ZooKeeper
    /// engine applies it sequentially (the client has no multi op).
    fn write(&self, ops: &[(String, String)]) -> Result<(), StoreError>;

    /// Write `value` only if the key currently holds `expected`.
    ///
    /// `expected = None` requires the key to be absent. Returns whether the
    /// write took place.
    fn check_and_set(
        &self,
        path: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError>;

    fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Direct children names (not full paths) of a key.
    fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Delete a key; with `recursive` the whole subtree.
    fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError>;

    /// Install a persistent data watch.
    fn watch_data(&self, path: &str, callback: WatchCallback) -> Result<(), StoreError>;

    /// Install a persistent children watch.
    fn watch_children(&self, path: &str, callback: WatchCallback) -> Result<(), StoreError>;

    /// Take a distributed RW lock rooted at `path`, blocking until held.
    fn lock(&self, path: &str, kind: LockKind) -> Result<LockGuard, StoreError>;
}

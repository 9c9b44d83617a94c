//! Typed facade over a store engine.
//!
//! Every other crate talks to the store through a [`Handle`]: logical keys
//! in, strings out. The handle owns the schema indirection and the
//! bootstrap of the base hierarchy.

use std::sync::Arc;

use crate::schema::{BaseKey, Key, Schema};
use crate::store::{LockGuard, LockKind, Store, WatchCallback};
use crate::StoreError;

#[derive(Clone)]
pub struct Handle {
    store: Arc<dyn Store>,
    schema: Schema,
}

impl Handle {
    /// Wrap an engine, negotiating the schema version: an empty store is
    /// bootstrapped to the current version, an existing store must carry a
    /// version this build understands.
    pub fn new(store: Arc<dyn Store>) -> Result<Self, StoreError> {
        let schema = Schema::current();
        let version_path = schema.path(&Key::Base(BaseKey::SchemaVersion));
        let schema = match store.read(&version_path)? {
            Some(raw) => {
                let version: u32 = raw.trim().parse().map_err(|_| {
                    StoreError::Backend(format!("unparsable schema version '{raw}'"))
                })?;
                Schema::version(version).ok_or_else(|| {
                    StoreError::Backend(format!("unsupported schema version {version}"))
                })?
            }
            None => {
                store.write(&[(version_path, Schema::CURRENT_VERSION.to_string())])?;
                schema
            }
        };

        let handle = Handle { store, schema };
        handle.bootstrap()?;
        Ok(handle)
    }

    /// Create the base hierarchy if missing.
    fn bootstrap(&self) -> Result<(), StoreError> {
        let mut ops = Vec::new();
        for path in self.schema.base_paths() {
            if !self.store.exists(&path)? {
                ops.push((path, String::new()));
            }
        }
        if !ops.is_empty() {
            self.store.write(&ops)?;
        }
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self, key: &Key) -> String {
        self.schema.path(key)
    }

    pub fn read(&self, key: Key) -> Result<Option<String>, StoreError> {
        self.store.read(&self.path(&key))
    }

    /// Batched read; one result slot per requested key.
    pub fn read_many(&self, keys: &[Key]) -> Result<Vec<Option<String>>, StoreError> {
        keys.iter().map(|key| self.store.read(&self.path(key))).collect()
    }

    pub fn write(&self, ops: &[(Key, String)]) -> Result<(), StoreError> {
        let resolved: Vec<(String, String)> = ops
            .iter()
            .map(|(key, value)| (self.path(key), value.clone()))
            .collect();
        self.store.write(&resolved)
    }

    pub fn check_and_set(
        &self,
        key: Key,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.store.check_and_set(&self.path(&key), expected, value)
    }

    pub fn exists(&self, key: Key) -> Result<bool, StoreError> {
        self.store.exists(&self.path(&key))
    }

    pub fn children(&self, key: Key) -> Result<Vec<String>, StoreError> {
        self.store.children(&self.path(&key))
    }

    pub fn delete(&self, key: Key, recursive: bool) -> Result<(), StoreError> {
        self.store.delete(&self.path(&key), recursive)
    }

    pub fn watch_data(&self, key: Key, callback: WatchCallback) -> Result<(), StoreError> {
        self.store.watch_data(&self.path(&key), callback)
    }

    pub fn watch_children(&self, key: Key, callback: WatchCallback) -> Result<(), StoreError> {
        self.store.watch_children(&self.path(&key), callback)
    }

    pub fn read_lock(&self, key: Key) -> Result<LockGuard, StoreError> {
        self.store.lock(&self.path(&key), LockKind::Read)
    }

    pub fn write_lock(&self, key: Key) -> Result<LockGuard, StoreError> {
        self.store.lock(&self.path(&key), LockKind::Write)
    }

    /// Post a work item to a single-writer command queue key.
    ///
    /// The write lock serializes producers; the consuming node holds the
    /// same lock while it reads, executes and acknowledges.
    pub fn post_command(&self, key: Key, command: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock(key.clone())?;
        self.write(&[(key, command.to_owned())])
    }

    /// Consume a command queue key under the write lock, replacing its
    /// content with the result of `consume`.
    pub fn consume_command<F>(&self, key: Key, consume: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<String>) -> String,
    {
        let _guard = self.write_lock(key.clone())?;
        let current = self.read(key.clone())?;
        self.write(&[(key, consume(current))])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::{DomainKey, NodeKey};
    use crate::MemStore;

    fn handle() -> Handle {
        Handle::new(Arc::new(MemStore::new())).unwrap()
    }

    #[test]
    fn test_bootstrap_writes_schema_version() {
        let store = Arc::new(MemStore::new());
        let handle = Handle::new(Arc::clone(&store) as Arc<dyn Store>).unwrap();
        assert_eq!(
            handle.read(Key::Base(BaseKey::SchemaVersion)).unwrap().as_deref(),
            Some("0")
        );
        // base paths exist
        assert!(handle.exists(Key::Base(BaseKey::Node)).unwrap());
        assert!(handle.exists(Key::Base(BaseKey::Domain)).unwrap());
    }

    #[test]
    fn test_unsupported_schema_version_is_fatal() {
        let store = Arc::new(MemStore::new());
        store
            .write(&[("/schema/version".to_owned(), "7".to_owned())])
            .unwrap();
        assert!(Handle::new(store as Arc<dyn Store>).is_err());
    }

    #[test]
    fn test_typed_write_read_roundtrip() {
        let handle = handle();
        handle
            .write(&[
                (Key::Node("hv1", NodeKey::DaemonState), "run".to_owned()),
                (Key::Domain("u1", DomainKey::Node), "hv1".to_owned()),
            ])
            .unwrap();
        assert_eq!(
            handle.read(Key::Node("hv1", NodeKey::DaemonState)).unwrap().as_deref(),
            Some("run")
        );
        assert_eq!(handle.children(Key::Base(BaseKey::Node)).unwrap(), vec!["hv1"]);
        let many = handle
            .read_many(&[
                Key::Domain("u1", DomainKey::Node),
                Key::Domain("u1", DomainKey::State),
            ])
            .unwrap();
        assert_eq!(many[0].as_deref(), Some("hv1"));
        assert!(many[1].is_none());
    }

    #[test]
    fn test_command_queue_roundtrip() {
        let handle = handle();
        handle
            .post_command(Key::Base(BaseKey::CephCommand), "osd add hv1 /dev/sdb")
            .unwrap();
        handle
            .consume_command(Key::Base(BaseKey::CephCommand), |current| {
                assert_eq!(current.as_deref(), Some("osd add hv1 /dev/sdb"));
                "success-osd add hv1 /dev/sdb".to_owned()
            })
            .unwrap();
        assert_eq!(
            handle.read(Key::Base(BaseKey::CephCommand)).unwrap().as_deref(),
            Some("success-osd add hv1 /dev/sdb")
        );
    }
}

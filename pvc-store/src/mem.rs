//! In-memory store engine.
//!
//! Implements the full [`Store`] contract including atomic multi-writes,
//! persistent watches and RW locks. Backs every integration test and
//! single-node development; semantics are a superset of the ZooKeeper
//! engine (multi-writes are atomic here).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};

use crate::store::{LockGuard, LockKind, Store, WatchCallback, WatchEvent};
use crate::StoreError;

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

#[derive(Default)]
struct MemInner {
    data: Mutex<BTreeMap<String, String>>,
    data_watches: Mutex<HashMap<String, Vec<Arc<WatchCallback>>>>,
    child_watches: Mutex<HashMap<String, Vec<Arc<WatchCallback>>>>,
    locks: Mutex<HashMap<String, LockState>>,
    lock_cv: Condvar,
}

#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn parent(path: &str) -> Option<&str> {
        path.rsplit_once('/')
            .map(|(parent, _)| if parent.is_empty() { "/" } else { parent })
    }

    fn children_of(data: &BTreeMap<String, String>, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        let mut children: Vec<String> = Vec::new();
        for key in data.range(prefix.clone()..) {
            let (key, _) = key;
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            let name = rest.split('/').next().unwrap_or(rest);
            if !name.is_empty() && children.last().map(String::as_str) != Some(name) {
                children.push(name.to_owned());
            }
        }
        children.dedup();
        children
    }

    /// Insert a key, creating missing parents, recording fired paths.
    fn insert(
        data: &mut BTreeMap<String, String>,
        path: &str,
        value: &str,
        touched_parents: &mut Vec<String>,
    ) {
        let mut ancestors: Vec<&str> = Vec::new();
        let mut current = path;
        while let Some(parent) = Self::parent(current) {
            if parent == "/" || data.contains_key(parent) {
                break;
            }
            ancestors.push(parent);
            current = parent;
        }
        for ancestor in ancestors.into_iter().rev() {
            data.insert(ancestor.to_owned(), String::new());
            if let Some(grandparent) = Self::parent(ancestor) {
                touched_parents.push(grandparent.to_owned());
            }
        }
        let created = !data.contains_key(path);
        data.insert(path.to_owned(), value.to_owned());
        if created {
            if let Some(parent) = Self::parent(path) {
                touched_parents.push(parent.to_owned());
            }
        }
    }

    fn fire(&self, events: Vec<WatchEvent>) {
        for event in events {
            let callbacks: Vec<Arc<WatchCallback>> = match &event {
                WatchEvent::Data { path, .. } => {
                    let watches = self.inner.data_watches.lock().unwrap();
                    watches.get(path).cloned().unwrap_or_default()
                }
                WatchEvent::Children { path, .. } => {
                    let watches = self.inner.child_watches.lock().unwrap();
                    watches.get(path).cloned().unwrap_or_default()
                }
            };
            for callback in callbacks {
                callback(&event);
            }
        }
    }

    /// Build child-change events for a deduplicated parent list.
    fn child_events(&self, parents: Vec<String>) -> Vec<WatchEvent> {
        let data = self.inner.data.lock().unwrap();
        let mut parents = parents;
        parents.sort();
        parents.dedup();
        parents
            .into_iter()
            .map(|parent| WatchEvent::Children {
                children: Self::children_of(&data, &parent),
                path: parent,
            })
            .collect()
    }
}

impl Store for MemStore {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.data.lock().unwrap().get(path).cloned())
    }

    fn write(&self, ops: &[(String, String)]) -> Result<(), StoreError> {
        let mut touched_parents = Vec::new();
        let mut data_events = Vec::new();
        {
            let mut data = self.inner.data.lock().unwrap();
            for (path, value) in ops {
                Self::insert(&mut data, path, value, &mut touched_parents);
                data_events.push(WatchEvent::Data {
                    path: path.clone(),
                    value: Some(value.clone()),
                });
            }
        }
        self.fire(data_events);
        let child_events = self.child_events(touched_parents);
        self.fire(child_events);
        Ok(())
    }

    fn check_and_set(
        &self,
        path: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut touched_parents = Vec::new();
        {
            let mut data = self.inner.data.lock().unwrap();
            if data.get(path).map(String::as_str) != expected {
                return Ok(false);
            }
            Self::insert(&mut data, path, value, &mut touched_parents);
        }
        self.fire(vec![WatchEvent::Data {
            path: path.to_owned(),
            value: Some(value.to_owned()),
        }]);
        let child_events = self.child_events(touched_parents);
        self.fire(child_events);
        Ok(true)
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.inner.data.lock().unwrap().contains_key(path))
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let data = self.inner.data.lock().unwrap();
        Ok(Self::children_of(&data, path))
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError> {
        let mut data_events = Vec::new();
        let parent = Self::parent(path).map(str::to_owned);
        {
            let mut data = self.inner.data.lock().unwrap();
            if !data.contains_key(path) {
                return Err(StoreError::NoNode(path.to_owned()));
            }
            if !Self::children_of(&data, path).is_empty() && !recursive {
                return Err(StoreError::Backend(format!("{path} has children")));
            }
            let prefix = format!("{path}/");
            let doomed: Vec<String> = data
                .keys()
                .filter(|key| *key == path || key.starts_with(&prefix))
                .cloned()
                .collect();
            for key in doomed {
                data.remove(&key);
                data_events.push(WatchEvent::Data {
                    path: key,
                    value: None,
                });
            }
        }
        self.fire(data_events);
        if let Some(parent) = parent {
            let child_events = self.child_events(vec![parent]);
            self.fire(child_events);
        }
        Ok(())
    }

    fn watch_data(&self, path: &str, callback: WatchCallback) -> Result<(), StoreError> {
        self.inner
            .data_watches
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }

    fn watch_children(&self, path: &str, callback: WatchCallback) -> Result<(), StoreError> {
        self.inner
            .child_watches
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }

    fn lock(&self, path: &str, kind: LockKind) -> Result<LockGuard, StoreError> {
        let mut locks = self.inner.locks.lock().unwrap();
        loop {
            let state = locks.entry(path.to_owned()).or_default();
            let acquired = match kind {
                LockKind::Read => !state.writer,
                LockKind::Write => !state.writer && state.readers == 0,
            };
            if acquired {
                match kind {
                    LockKind::Read => state.readers += 1,
                    LockKind::Write => state.writer = true,
                }
                break;
            }
            locks = self.inner.lock_cv.wait(locks).unwrap();
        }
        drop(locks);

        let inner = Arc::clone(&self.inner);
        let path = path.to_owned();
        Ok(LockGuard::new(Box::new(move || {
            let mut locks = inner.locks.lock().unwrap();
            if let Some(state) = locks.get_mut(&path) {
                match kind {
                    LockKind::Read => state.readers = state.readers.saturating_sub(1),
                    LockKind::Write => state.writer = false,
                }
            }
            inner.lock_cv.notify_all();
        })))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_write_read_children() {
        let store = MemStore::new();
        store
            .write(&[
                ("/nodes/hv1/daemonstate".to_owned(), "run".to_owned()),
                ("/nodes/hv2/daemonstate".to_owned(), "init".to_owned()),
            ])
            .unwrap();
        assert_eq!(
            store.read("/nodes/hv1/daemonstate").unwrap().as_deref(),
            Some("run")
        );
        assert_eq!(store.children("/nodes").unwrap(), vec!["hv1", "hv2"]);
        assert!(store.exists("/nodes/hv2").unwrap());
    }

    #[test]
    fn test_recursive_delete_removes_subtree() {
        let store = MemStore::new();
        store
            .write(&[
                ("/domains/u1/state".to_owned(), "start".to_owned()),
                ("/domains/u1/xml".to_owned(), "<domain/>".to_owned()),
            ])
            .unwrap();
        assert!(store.delete("/domains/u1", false).is_err());
        store.delete("/domains/u1", true).unwrap();
        assert!(!store.exists("/domains/u1").unwrap());
        assert!(store.children("/domains").unwrap().is_empty());
    }

    #[test]
    fn test_check_and_set() {
        let store = MemStore::new();
        assert!(store.check_and_set("/config/primary_node", None, "hv1").unwrap());
        assert!(!store.check_and_set("/config/primary_node", None, "hv2").unwrap());
        assert!(store
            .check_and_set("/config/primary_node", Some("hv1"), "hv2")
            .unwrap());
        assert_eq!(
            store.read("/config/primary_node").unwrap().as_deref(),
            Some("hv2")
        );
    }

    #[test]
    fn test_data_watch_fires_on_write_and_delete() {
        let store = MemStore::new();
        store.write(&[("/k".to_owned(), "a".to_owned())]).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        store
            .watch_data(
                "/k",
                Box::new(move |_event| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        store.write(&[("/k".to_owned(), "b".to_owned())]).unwrap();
        store.delete("/k", false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_children_watch_fires_on_new_child() {
        let store = MemStore::new();
        store.write(&[("/nodes".to_owned(), String::new())]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .watch_children(
                "/nodes",
                Box::new(move |event| {
                    if let WatchEvent::Children { children, .. } = event {
                        sink.lock().unwrap().push(children.clone());
                    }
                }),
            )
            .unwrap();
        store
            .write(&[("/nodes/hv1/daemonstate".to_owned(), "init".to_owned())])
            .unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|c| c.contains(&"hv1".to_owned())));
    }

    #[test]
    fn test_write_lock_excludes_readers() {
        let store = MemStore::new();
        let guard = store.lock("/cmd/ceph", LockKind::Write).unwrap();
        let store2 = store.clone();
        let reader = std::thread::spawn(move || {
            let _guard = store2.lock("/cmd/ceph", LockKind::Read).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reader.is_finished());
        drop(guard);
        reader.join().unwrap();
    }
}

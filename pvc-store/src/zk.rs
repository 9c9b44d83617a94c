//! ZooKeeper store engine.
//!
//! ZooKeeper watches are one-shot; this engine re-arms them after every
//! fire and re-arms the whole registry when the session reconnects, so the
//! [`Store`] watch contract (persistent watches) holds. Locks use the
//! classic ephemeral-sequential recipe under a dedicated `/locks` namespace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;
use zookeeper::{Acl, CreateMode, WatchedEvent, ZkError, ZkState, ZooKeeper};

use crate::store::{LockGuard, LockKind, Store, WatchCallback, WatchEvent};
use crate::StoreError;

/// Engine-internal namespace for lock nodes, kept apart from data subtrees
/// so lock children never show up in `children()` listings.
const LOCK_ROOT: &str = "/locks";

struct ZkInner {
    zk: ZooKeeper,
    data_watches: Mutex<HashMap<String, Vec<Arc<WatchCallback>>>>,
    child_watches: Mutex<HashMap<String, Vec<Arc<WatchCallback>>>>,
}

#[derive(Clone)]
pub struct ZkStore {
    inner: Arc<ZkInner>,
}

impl ZkStore {
    /// Connect to the ZooKeeper ensemble at `connect_string`
    /// (e.g. `"coord1:2181,coord2:2181,coord3:2181"`).
    pub fn connect(connect_string: &str, timeout: Duration) -> Result<Self, StoreError> {
        let zk = ZooKeeper::connect(connect_string, timeout, |_event: WatchedEvent| {})
            .map_err(|err| StoreError::Unavailable(format!("{err:?}")))?;

        let inner = Arc::new(ZkInner {
            zk,
            data_watches: Mutex::new(HashMap::new()),
            child_watches: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        let _subscription = inner.zk.add_listener(move |state: ZkState| {
            if state == ZkState::Connected {
                if let Some(inner) = weak.upgrade() {
                    Self::rearm_all(&inner);
                }
            }
        });

        Ok(ZkStore { inner })
    }

    pub fn close(&self) {
        let _ = self.inner.zk.close();
    }

    /// Re-arm (and fire, to resync) every registered watch after a session
    /// re-establishment.
    fn rearm_all(inner: &Arc<ZkInner>) {
        let data_paths: Vec<String> = inner.data_watches.lock().unwrap().keys().cloned().collect();
        for path in data_paths {
            Self::fire_data(inner, &path);
        }
        let child_paths: Vec<String> =
            inner.child_watches.lock().unwrap().keys().cloned().collect();
        for path in child_paths {
            Self::fire_children(inner, &path);
        }
    }

    /// Arm the data watch on `path` and return its current value.
    fn arm_data(inner: &Arc<ZkInner>, path: &str) -> Option<String> {
        let weak = Arc::downgrade(inner);
        let event_path = path.to_owned();
        let watcher = move |_event: WatchedEvent| {
            if let Some(inner) = weak.upgrade() {
                Self::fire_data(&inner, &event_path);
            }
        };

        match inner.zk.get_data_w(path, watcher) {
            Ok((bytes, _stat)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(ZkError::NoNode) => {
                // watch for creation instead
                let weak = Arc::downgrade(inner);
                let event_path = path.to_owned();
                let _ = inner.zk.exists_w(path, move |_event: WatchedEvent| {
                    if let Some(inner) = weak.upgrade() {
                        Self::fire_data(&inner, &event_path);
                    }
                });
                None
            }
            Err(err) => {
                warn!("failed to arm data watch on {path}: {err:?}");
                None
            }
        }
    }

    fn fire_data(inner: &Arc<ZkInner>, path: &str) {
        let value = Self::arm_data(inner, path);
        let callbacks = {
            let watches = inner.data_watches.lock().unwrap();
            watches.get(path).cloned().unwrap_or_default()
        };
        let event = WatchEvent::Data {
            path: path.to_owned(),
            value,
        };
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Arm the children watch on `path` and return the current child set.
    fn arm_children(inner: &Arc<ZkInner>, path: &str) -> Vec<String> {
        let weak = Arc::downgrade(inner);
        let event_path = path.to_owned();
        let watcher = move |_event: WatchedEvent| {
            if let Some(inner) = weak.upgrade() {
                Self::fire_children(&inner, &event_path);
            }
        };

        match inner.zk.get_children_w(path, watcher) {
            Ok(mut children) => {
                children.sort();
                children
            }
            Err(ZkError::NoNode) => {
                let weak = Arc::downgrade(inner);
                let event_path = path.to_owned();
                let _ = inner.zk.exists_w(path, move |_event: WatchedEvent| {
                    if let Some(inner) = weak.upgrade() {
                        Self::fire_children(&inner, &event_path);
                    }
                });
                Vec::new()
            }
            Err(err) => {
                warn!("failed to arm children watch on {path}: {err:?}");
                Vec::new()
            }
        }
    }

    fn fire_children(inner: &Arc<ZkInner>, path: &str) {
        let children = Self::arm_children(inner, path);
        let callbacks = {
            let watches = inner.child_watches.lock().unwrap();
            watches.get(path).cloned().unwrap_or_default()
        };
        let event = WatchEvent::Children {
            path: path.to_owned(),
            children,
        };
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Create every missing component of `path` with empty data.
    fn ensure_path(&self, path: &str) -> Result<(), StoreError> {
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            match self.inner.zk.create(
                &current,
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_one(&self, path: &str, value: &str) -> Result<(), StoreError> {
        match self
            .inner
            .zk
            .set_data(path, value.as_bytes().to_vec(), None)
        {
            Ok(_) => Ok(()),
            Err(ZkError::NoNode) => {
                if let Some((parent, _)) = path.rsplit_once('/') {
                    if !parent.is_empty() {
                        self.ensure_path(parent)?;
                    }
                }
                match self.inner.zk.create(
                    path,
                    value.as_bytes().to_vec(),
                    Acl::open_unsafe().clone(),
                    CreateMode::Persistent,
                ) {
                    Ok(_) => Ok(()),
                    // lost a creation race; the set still must win
                    Err(ZkError::NodeExists) => {
                        self.inner
                            .zk
                            .set_data(path, value.as_bytes().to_vec(), None)?;
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn sequence_number(name: &str) -> Option<u64> {
        name.rsplit('-').next()?.parse().ok()
    }

    fn lock_dir(path: &str) -> String {
        format!("{LOCK_ROOT}{path}")
    }
}

impl Store for ZkStore {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError> {
        match self.inner.zk.get_data(path, false) {
            Ok((bytes, _stat)) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(ZkError::NoNode) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // Sequential application; the client exposes no multi op. Callers that
    // need exclusion use the write lock.
    fn write(&self, ops: &[(String, String)]) -> Result<(), StoreError> {
        for (path, value) in ops {
            self.write_one(path, value)?;
        }
        Ok(())
    }

    fn check_and_set(
        &self,
        path: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        match self.inner.zk.get_data(path, false) {
            Ok((bytes, stat)) => {
                let current = String::from_utf8_lossy(&bytes);
                if expected != Some(current.as_ref()) {
                    return Ok(false);
                }
                match self.inner.zk.set_data(
                    path,
                    value.as_bytes().to_vec(),
                    Some(stat.version),
                ) {
                    Ok(_) => Ok(true),
                    Err(ZkError::BadVersion) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            Err(ZkError::NoNode) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some((parent, _)) = path.rsplit_once('/') {
                    if !parent.is_empty() {
                        self.ensure_path(parent)?;
                    }
                }
                match self.inner.zk.create(
                    path,
                    value.as_bytes().to_vec(),
                    Acl::open_unsafe().clone(),
                    CreateMode::Persistent,
                ) {
                    Ok(_) => Ok(true),
                    Err(ZkError::NodeExists) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        match self.inner.zk.exists(path, false) {
            Ok(stat) => Ok(stat.is_some()),
            Err(ZkError::NoNode) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        match self.inner.zk.get_children(path, false) {
            Ok(mut children) => {
                children.sort();
                Ok(children)
            }
            Err(ZkError::NoNode) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), StoreError> {
        if recursive {
            for child in self.children(path)? {
                self.delete(&format!("{path}/{child}"), true)?;
            }
        }
        match self.inner.zk.delete(path, None) {
            Ok(()) | Err(ZkError::NoNode) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn watch_data(&self, path: &str, callback: WatchCallback) -> Result<(), StoreError> {
        self.inner
            .data_watches
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push(Arc::new(callback));
        Self::arm_data(&self.inner, path);
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
        Self::arm_children(&self.inner, path);
        Ok(())
    }

    fn lock(&self, path: &str, kind: LockKind) -> Result<LockGuard, StoreError> {
        let lock_dir = Self::lock_dir(path);
        self.ensure_path(&lock_dir)?;

        let prefix = match kind {
            LockKind::Read => "read-",
            LockKind::Write => "write-",
        };
        let my_path = self
            .inner
            .zk
            .create(
                &format!("{lock_dir}/{prefix}"),
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::EphemeralSequential,
            )
            .map_err(|err| StoreError::Lock(path.to_owned(), format!("{err:?}")))?;
        let my_name = my_path.rsplit('/').next().unwrap_or(&my_path).to_owned();
        let my_seq = Self::sequence_number(&my_name)
            .ok_or_else(|| StoreError::Lock(path.to_owned(), "bad sequence node".into()))?;

        loop {
            let contenders = self.inner.zk.get_children(&lock_dir, false)?;
            let blocker = contenders
                .iter()
                .filter(|name| {
                    let is_write = name.starts_with("write-");
                    match kind {
                        LockKind::Read => is_write,
                        LockKind::Write => true,
                    }
                })
                .filter_map(|name| Self::sequence_number(name).map(|seq| (seq, name)))
                .filter(|(seq, _)| *seq < my_seq)
                .max_by_key(|(seq, _)| *seq);

            let blocker = match blocker {
                Some((_seq, name)) => name.clone(),
                None => break,
            };

            // wait for the predecessor to go away, then re-evaluate
            let (tx, rx) = crossbeam_channel::bounded::<()>(1);
            let gone = self
                .inner
                .zk
                .exists_w(&format!("{lock_dir}/{blocker}"), move |_event: WatchedEvent| {
                    let _ = tx.try_send(());
                })?
                .is_none();
            if !gone {
                let _ = rx.recv_timeout(Duration::from_secs(30));
            }
        }

        let inner = Arc::clone(&self.inner);
        Ok(LockGuard::new(Box::new(move || {
            let _ = inner.zk.delete(&my_path, None);
        })))
    }
}

//! Coordination-store handler.
//!
//! All cluster state lives in a hierarchical key store. Consumers never
//! touch literal paths: they go through [`Handle`] with logical [`Key`]s,
//! which the versioned [`Schema`] resolves. Two engines implement the
//! [`Store`] trait: [`MemStore`] (atomic multi-writes, used by every test
//! and by single-node development) and [`ZkStore`] (ZooKeeper).

mod error;
mod handle;
mod mem;
mod schema;
mod store;
mod zk;

pub use error::StoreError;
pub use handle::Handle;
pub use mem::MemStore;
pub use schema::{
    BaseKey, DomainKey, FaultKey, Key, NetworkKey, NodeKey, OsdKey, PluginKey, ReservationKey,
    RuleDirection, RuleKey, Schema, SnapshotKey, TagKey, VfKey,
};
pub use store::{LockGuard, LockKind, Store, WatchCallback, WatchEvent};
pub use zk::ZkStore;

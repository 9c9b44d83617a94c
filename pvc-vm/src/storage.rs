//! RBD snapshot and advisory-lock handling.
//!
//! Volumes are recorded per VM as a comma-joined `pool/volume` list. All
//! operations go through the `rbd` tool; nothing here talks to Ceph
//! directly.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, format_err, Context, Error};
use tracing::{info, warn};

use pvc_common::command::run_command;
use pvc_store::{DomainKey, Handle, Key, SnapshotKey};

const RBD_TIMEOUT: Duration = Duration::from_secs(30);

fn volume_list(handle: &Handle, uuid: &str) -> Result<Vec<String>, Error> {
    Ok(handle
        .read(Key::Domain(uuid, DomainKey::StorageVolumes))?
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|volume| !volume.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Create `snap_name` across all of the VM's volumes and record it.
///
/// The store record is written as one batch only after every RBD snapshot
/// succeeded; a partial RBD failure rolls the already-created snapshots
/// back, so the operation is all-or-nothing on both sides.
pub fn snapshot_create(handle: &Handle, uuid: &str, snap_name: &str) -> Result<(), Error> {
    let volumes = volume_list(handle, uuid)?;
    if volumes.is_empty() {
        bail!("VM {uuid} has no volumes to snapshot");
    }
    if handle.exists(Key::Snapshot(uuid, snap_name, SnapshotKey::Root))? {
        bail!("snapshot {snap_name} already exists for VM {uuid}");
    }

    let mut created: Vec<String> = Vec::new();
    for volume in &volumes {
        let spec = format!("{volume}@{snap_name}");
        let output = run_command(&format!("rbd snap create {spec}"), Some(RBD_TIMEOUT))?;
        if !output.success() {
            for done in &created {
                let _ = run_command(&format!("rbd snap rm {done}"), Some(RBD_TIMEOUT));
            }
            bail!("rbd snap create {spec} failed: {}", output.stderr.trim());
        }
        created.push(spec);
    }

    let xml = handle
        .read(Key::Domain(uuid, DomainKey::Xml))?
        .unwrap_or_default();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    handle.write(&[
        (
            Key::Snapshot(uuid, snap_name, SnapshotKey::Name),
            snap_name.to_owned(),
        ),
        (
            Key::Snapshot(uuid, snap_name, SnapshotKey::Timestamp),
            timestamp.to_string(),
        ),
        (Key::Snapshot(uuid, snap_name, SnapshotKey::Xml), xml),
        (
            Key::Snapshot(uuid, snap_name, SnapshotKey::RbdSnapshots),
            created.join(","),
        ),
    ])?;
    info!(uuid, snap_name, "created snapshot");
    Ok(())
}

/// Remove `snap_name` from RBD and the store.
pub fn snapshot_remove(handle: &Handle, uuid: &str, snap_name: &str) -> Result<(), Error> {
    let recorded = handle
        .read(Key::Snapshot(uuid, snap_name, SnapshotKey::RbdSnapshots))?
        .ok_or_else(|| format_err!("no snapshot {snap_name} for VM {uuid}"))?;

    for spec in recorded.split(',').filter(|spec| !spec.is_empty()) {
        let output = run_command(&format!("rbd snap rm {spec}"), Some(RBD_TIMEOUT))?;
        if !output.success() {
            warn!(uuid, spec, "rbd snap rm failed: {}", output.stderr.trim());
        }
    }

    handle.delete(Key::Snapshot(uuid, snap_name, SnapshotKey::Root), true)?;
    info!(uuid, snap_name, "removed snapshot");
    Ok(())
}

/// Break any stale advisory locks on the VM's volumes.
///
/// Run before starting a VM whose previous owner was fenced; a dead owner
/// leaves its exclusive-lock behind and the new owner cannot map the image
/// until it is removed.
pub fn flush_locks(handle: &Handle, uuid: &str) -> Result<(), Error> {
    for volume in volume_list(handle, uuid)? {
        let listing = run_command(
            &format!("rbd lock list --format json {volume}"),
            Some(RBD_TIMEOUT),
        )?;
        if !listing.success() {
            warn!(uuid, %volume, "rbd lock list failed: {}", listing.stderr.trim());
            continue;
        }

        let locks: serde_json::Value = serde_json::from_str(listing.stdout.trim())
            .with_context(|| format!("unparsable rbd lock listing for {volume}"))?;
        let Some(locks) = locks.as_array() else {
            continue;
        };
        for lock in locks {
            let (Some(id), Some(locker)) = (
                lock.get("id").and_then(|v| v.as_str()),
                lock.get("locker").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            info!(uuid, %volume, id, "breaking RBD lock");
            let output = run_command(
                &format!("rbd lock remove {volume} {id} {locker}"),
                Some(RBD_TIMEOUT),
            )?;
            if !output.success() {
                bail!(
                    "failed to break lock {id} on {volume}: {}",
                    output.stderr.trim()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use pvc_store::MemStore;

    fn handle() -> Handle {
        Handle::new(Arc::new(MemStore::new())).unwrap()
    }

    #[test]
    fn test_snapshot_create_requires_volumes() {
        let handle = handle();
        handle
            .write(&[(Key::Domain("u1", DomainKey::StorageVolumes), String::new())])
            .unwrap();
        assert!(snapshot_create(&handle, "u1", "snap1").is_err());
        // nothing was recorded
        assert!(!handle
            .exists(Key::Snapshot("u1", "snap1", SnapshotKey::Root))
            .unwrap());
    }

    #[test]
    fn test_snapshot_remove_unknown_fails() {
        let handle = handle();
        assert!(snapshot_remove(&handle, "u1", "nope").is_err());
    }

    #[test]
    fn test_flush_locks_with_no_volumes_is_noop() {
        let handle = handle();
        handle
            .write(&[(Key::Domain("u1", DomainKey::StorageVolumes), String::new())])
            .unwrap();
        assert!(flush_locks(&handle, "u1").is_ok());
    }
}

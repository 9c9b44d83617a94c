//! Cluster fault records.
//!
//! A fault is a cluster-wide condition with a health delta, first/last
//! timestamps and an acknowledge flag. Faults are upserted: re-raising an
//! existing fault refreshes everything except `first_time` and the ack
//! flag.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;
use tracing::info;

use pvc_store::{BaseKey, FaultKey, Handle, Key};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Raise or refresh a fault record.
pub fn generate_fault(
    handle: &Handle,
    fault_id: &str,
    delta: u64,
    message: &str,
    details: Option<&str>,
) -> Result<(), Error> {
    let now = now_secs().to_string();
    let mut ops = vec![
        (Key::Fault(fault_id, FaultKey::LastTime), now.clone()),
        (Key::Fault(fault_id, FaultKey::Delta), delta.to_string()),
        (Key::Fault(fault_id, FaultKey::Message), message.to_owned()),
        (
            Key::Fault(fault_id, FaultKey::Details),
            details.unwrap_or_default().to_owned(),
        ),
    ];

    if !handle.exists(Key::Fault(fault_id, FaultKey::Root))? {
        info!(fault_id, "raising new fault: {message}");
        ops.push((Key::Fault(fault_id, FaultKey::FirstTime), now));
        ops.push((
            Key::Fault(fault_id, FaultKey::Acknowledged),
            "false".to_owned(),
        ));
    }

    handle.write(&ops)?;
    Ok(())
}

/// Mark a fault as acknowledged; it stays visible but stops alerting.
pub fn acknowledge_fault(handle: &Handle, fault_id: &str) -> Result<(), Error> {
    handle.write(&[(
        Key::Fault(fault_id, FaultKey::Acknowledged),
        "true".to_owned(),
    )])?;
    Ok(())
}

/// Remove a fault record entirely.
pub fn delete_fault(handle: &Handle, fault_id: &str) -> Result<(), Error> {
    handle.delete(Key::Fault(fault_id, FaultKey::Root), true)?;
    Ok(())
}

/// All current fault ids.
pub fn list_faults(handle: &Handle) -> Result<Vec<String>, Error> {
    Ok(handle.children(Key::Base(BaseKey::Faults))?)
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
    fn test_upsert_preserves_first_time_and_ack() {
        let handle = handle();
        generate_fault(&handle, "DEAD_NODE_hv2", 50, "Node hv2 was dead", None).unwrap();
        let first = handle
            .read(Key::Fault("DEAD_NODE_hv2", FaultKey::FirstTime))
            .unwrap()
            .unwrap();
        acknowledge_fault(&handle, "DEAD_NODE_hv2").unwrap();

        generate_fault(&handle, "DEAD_NODE_hv2", 50, "Node hv2 was dead and/or fenced", None)
            .unwrap();
        assert_eq!(
            handle
                .read(Key::Fault("DEAD_NODE_hv2", FaultKey::FirstTime))
                .unwrap()
                .unwrap(),
            first
        );
        assert_eq!(
            handle
                .read(Key::Fault("DEAD_NODE_hv2", FaultKey::Acknowledged))
                .unwrap()
                .as_deref(),
            Some("true")
        );
        assert_eq!(
            handle
                .read(Key::Fault("DEAD_NODE_hv2", FaultKey::Message))
                .unwrap()
                .as_deref(),
            Some("Node hv2 was dead and/or fenced")
        );
    }

    #[test]
    fn test_delete_fault() {
        let handle = handle();
        generate_fault(&handle, "VM_FAILED_web1", 10, "VM web1 was failed", Some("boom")).unwrap();
        assert_eq!(list_faults(&handle).unwrap(), vec!["VM_FAILED_web1"]);
        delete_fault(&handle, "VM_FAILED_web1").unwrap();
        assert!(list_faults(&handle).unwrap().is_empty());
    }
}

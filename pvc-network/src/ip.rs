//! Address binding on local devices.
//!
//! Used for per-network gateways and for the cluster floating IPs. Binding
//! announces the address with gratuitous ARP so peers repoint quickly
//! after a primary transition.

use anyhow::{bail, Error};
use tracing::warn;

use pvc_common::command::run_command;
use pvc_common::Ipv4Cidr;

/// Bind `address` on `device` and announce it.
///
/// An already-bound address is not an error; a takeover retry must be able
/// to pass over addresses it bound the previous attempt.
pub fn bind_address(address: &Ipv4Cidr, device: &str) -> Result<(), Error> {
    let output = run_command(&format!("ip address add {address} dev {device}"), None)?;
    if !output.success() && !output.stderr.contains("File exists") {
        bail!(
            "failed to bind {address} on {device}: {}",
            output.stderr.trim()
        );
    }

    let ip = address.addr();
    let arping = run_command(
        &format!("arping -P -U -W 0.02 -c 2 -i {device} -S {ip} {ip}"),
        None,
    )?;
    if !arping.success() {
        warn!("gratuitous ARP for {ip} on {device} failed");
    }
    Ok(())
}

/// Remove `address` from `device`. A missing address is not an error.
pub fn unbind_address(address: &Ipv4Cidr, device: &str) -> Result<(), Error> {
    let output = run_command(&format!("ip address delete {address} dev {device}"), None)?;
    if !output.success() && !output.stderr.contains("Cannot assign") {
        warn!(
            "failed to unbind {address} from {device}: {}",
            output.stderr.trim()
        );
    }
    Ok(())
}

//! SR-IOV PF and VF management.
//!
//! PFs are provisioned at daemon startup from the configuration; VF
//! attributes live in the store and each attribute is driven by its own
//! watch, so an API write to a single attribute reprograms exactly that
//! attribute.

use anyhow::{bail, format_err, Error};
use tracing::{info, warn};

use pvc_common::command::run_command;
use pvc_config::SriovDevice;
use pvc_store::{Handle, Key, VfKey};

/// Provision the configured PFs: VF count via sysfs, then MTU and link up.
pub fn setup_pf_devices(devices: &[SriovDevice]) -> Result<(), Error> {
    for device in devices {
        info!(
            phy = %device.phy,
            vfcount = device.vfcount,
            "provisioning SR-IOV physical device"
        );
        let sysfs = format!("/sys/class/net/{}/device/sriov_numvfs", device.phy);
        std::fs::write(&sysfs, device.vfcount.to_string())
            .map_err(|err| format_err!("failed to set VF count on {}: {err}", device.phy))?;
        let output = run_command(
            &format!("ip link set {} mtu {} up", device.phy, device.mtu),
            None,
        )?;
        if !output.success() {
            bail!(
                "failed to bring up SR-IOV device {}: {}",
                device.phy,
                output.stderr.trim()
            );
        }
    }
    Ok(())
}

/// One VF as registered under this node's subtree.
pub struct SriovVfInstance {
    handle: Handle,
    node_name: String,
    /// VF device name, e.g. `ens1f0v3`.
    vf: String,
}

impl SriovVfInstance {
    pub fn new(handle: Handle, node_name: &str, vf: &str) -> Self {
        SriovVfInstance {
            handle,
            node_name: node_name.to_owned(),
            vf: vf.to_owned(),
        }
    }

    pub fn vf(&self) -> &str {
        &self.vf
    }

    fn read(&self, field: VfKey) -> Result<Option<String>, Error> {
        Ok(self
            .handle
            .read(Key::SriovVf(&self.node_name, &self.vf, field))?)
    }

    fn phy(&self) -> Result<String, Error> {
        self.read(VfKey::Phy)?
            .ok_or_else(|| format_err!("VF {} has no phy recorded", self.vf))
    }

    /// VF index, parsed from the trailing `v<N>` of the device name.
    fn vf_id(&self) -> Result<u32, Error> {
        self.vf
            .rsplit('v')
            .next()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| format_err!("cannot derive VF id from '{}'", self.vf))
    }

    /// The attribute keys a dedicated watch is installed for.
    pub fn watched_attributes() -> &'static [VfKey] {
        &[
            VfKey::Mac,
            VfKey::Vlan,
            VfKey::Qos,
            VfKey::TxRateMin,
            VfKey::TxRateMax,
            VfKey::SpoofCheck,
            VfKey::LinkState,
            VfKey::Trust,
            VfKey::QueryRss,
        ]
    }

    /// Reprogram one attribute from its current store value.
    pub fn apply_attribute(&self, field: VfKey) -> Result<(), Error> {
        let phy = self.phy()?;
        let id = self.vf_id()?;

        let command = match field {
            VfKey::Mac => {
                let Some(mac) = self.read(VfKey::Mac)? else { return Ok(()) };
                format!("ip link set {phy} vf {id} mac {mac}")
            }
            // vlan and qos are one netlink attribute; either watch firing
            // reprograms both
            VfKey::Vlan | VfKey::Qos => {
                let vlan = self.read(VfKey::Vlan)?.unwrap_or_else(|| "0".to_owned());
                let qos = self.read(VfKey::Qos)?.unwrap_or_else(|| "0".to_owned());
                format!("ip link set {phy} vf {id} vlan {vlan} qos {qos}")
            }
            VfKey::TxRateMin => {
                let Some(rate) = self.read(VfKey::TxRateMin)? else { return Ok(()) };
                format!("ip link set {phy} vf {id} min_tx_rate {rate}")
            }
            VfKey::TxRateMax => {
                let Some(rate) = self.read(VfKey::TxRateMax)? else { return Ok(()) };
                format!("ip link set {phy} vf {id} max_tx_rate {rate}")
            }
            VfKey::SpoofCheck => {
                let flag = on_off(self.read(VfKey::SpoofCheck)?);
                format!("ip link set {phy} vf {id} spoofchk {flag}")
            }
            VfKey::LinkState => {
                let state = self
                    .read(VfKey::LinkState)?
                    .unwrap_or_else(|| "auto".to_owned());
                format!("ip link set {phy} vf {id} state {state}")
            }
            VfKey::Trust => {
                let flag = on_off(self.read(VfKey::Trust)?);
                format!("ip link set {phy} vf {id} trust {flag}")
            }
            VfKey::QueryRss => {
                let flag = on_off(self.read(VfKey::QueryRss)?);
                format!("ip link set {phy} vf {id} query_rss {flag}")
            }
            VfKey::Root | VfKey::Phy => return Ok(()),
        };

        let output = run_command(&command, None)?;
        if !output.success() {
            warn!(vf = %self.vf, "'{command}' failed: {}", output.stderr.trim());
        }
        Ok(())
    }
}

fn on_off(value: Option<String>) -> &'static str {
    match value.as_deref() {
        Some("True") | Some("true") | Some("on") => "on",
        _ => "off",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use pvc_store::MemStore;

    #[test]
    fn test_vf_id_parsing() {
        let handle = Handle::new(Arc::new(MemStore::new())).unwrap();
        let vf = SriovVfInstance::new(handle, "hv1", "ens1f0v3");
        assert_eq!(vf.vf_id().unwrap(), 3);

        let handle = Handle::new(Arc::new(MemStore::new())).unwrap();
        let vf = SriovVfInstance::new(handle, "hv1", "bogus");
        assert!(vf.vf_id().is_err());
    }

    #[test]
    fn test_on_off_mapping() {
        assert_eq!(on_off(Some("True".to_owned())), "on");
        assert_eq!(on_off(Some("False".to_owned())), "off");
        assert_eq!(on_off(None), "off");
    }
}

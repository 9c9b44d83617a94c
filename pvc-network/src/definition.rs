//! Network definitions as stored per VNI.

use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::Error;

use pvc_common::Ipv4Cidr;
use pvc_store::{Handle, Key, NetworkKey, ReservationKey};

/// How guests attach to a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// VXLAN overlay with gateway/DHCP/DNS services on the primary.
    Managed,
    /// Plain VLAN bridge on the guest bridge device.
    Bridged,
    /// SR-IOV VF passthrough.
    Direct,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Managed => "managed",
            NetworkType::Bridged => "bridged",
            NetworkType::Direct => "direct",
        }
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "managed" => Ok(NetworkType::Managed),
            "bridged" => Ok(NetworkType::Bridged),
            "direct" => Ok(NetworkType::Direct),
            other => Err(format!("invalid network type '{other}'")),
        }
    }
}

/// A static DHCP reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpReservation {
    pub mac: String,
    pub ip: String,
    pub hostname: String,
}

/// One network as defined in the store.
#[derive(Debug, Clone)]
pub struct NetworkDefinition {
    pub vni: String,
    pub net_type: NetworkType,
    pub domain: Option<String>,
    pub name_servers: Vec<String>,
    pub ip4_network: Option<Ipv4Cidr>,
    pub ip4_gateway: Option<Ipv4Addr>,
    pub dhcp4_enabled: bool,
    pub dhcp4_start: Option<Ipv4Addr>,
    pub dhcp4_end: Option<Ipv4Addr>,
}

impl NetworkDefinition {
    /// Read a network's definition from the store.
    pub fn read(handle: &Handle, vni: &str) -> Result<Self, Error> {
        let fields = handle.read_many(&[
            Key::Network(vni, NetworkKey::Type),
            Key::Network(vni, NetworkKey::Domain),
            Key::Network(vni, NetworkKey::NameServers),
            Key::Network(vni, NetworkKey::Ip4Network),
            Key::Network(vni, NetworkKey::Ip4Gateway),
            Key::Network(vni, NetworkKey::Ip4DhcpFlag),
            Key::Network(vni, NetworkKey::Ip4DhcpStart),
            Key::Network(vni, NetworkKey::Ip4DhcpEnd),
        ])?;

        let net_type = fields[0]
            .as_deref()
            .unwrap_or("bridged")
            .parse::<NetworkType>()
            .map_err(Error::msg)?;

        Ok(NetworkDefinition {
            vni: vni.to_owned(),
            net_type,
            domain: fields[1].clone().filter(|domain| !domain.is_empty()),
            name_servers: fields[2]
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|server| !server.is_empty())
                .map(str::to_owned)
                .collect(),
            ip4_network: fields[3].as_deref().and_then(|raw| raw.parse().ok()),
            ip4_gateway: fields[4].as_deref().and_then(|raw| raw.parse().ok()),
            dhcp4_enabled: fields[5].as_deref() == Some("True"),
            dhcp4_start: fields[6].as_deref().and_then(|raw| raw.parse().ok()),
            dhcp4_end: fields[7].as_deref().and_then(|raw| raw.parse().ok()),
        })
    }

    /// The static DHCP reservations of this network.
    pub fn reservations(&self, handle: &Handle) -> Result<Vec<DhcpReservation>, Error> {
        let mut reservations = Vec::new();
        for id in handle.children(Key::Network(&self.vni, NetworkKey::Ip4Reservations))? {
            let fields = handle.read_many(&[
                Key::Reservation(&self.vni, &id, ReservationKey::Mac),
                Key::Reservation(&self.vni, &id, ReservationKey::Ip),
                Key::Reservation(&self.vni, &id, ReservationKey::Hostname),
            ])?;
            let (Some(mac), Some(ip)) = (fields[0].clone(), fields[1].clone()) else {
                continue;
            };
            reservations.push(DhcpReservation {
                mac,
                ip,
                hostname: fields[2].clone().unwrap_or_else(|| id.clone()),
            });
        }
        Ok(reservations)
    }
}

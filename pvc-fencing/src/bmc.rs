//! BMC access via ipmitool.

use std::time::Duration;

use anyhow::Error;

use pvc_common::command::run_command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    Off,
    On,
    Status,
}

impl PowerOp {
    fn as_str(&self) -> &'static str {
        match self {
            PowerOp::Off => "off",
            PowerOp::On => "on",
            PowerOp::Status => "status",
        }
    }
}

/// One chassis power operation: `(succeeded, trimmed stdout)`.
pub trait Bmc: Send + Sync {
    fn chassis(&self, op: PowerOp, timeout: Option<Duration>) -> Result<(bool, String), Error>;
}

/// Builds a [`Bmc`] from the IPMI credentials stored for a node.
pub type BmcFactory = dyn Fn(&str, &str, &str) -> Box<dyn Bmc> + Send + Sync;

/// ipmitool over lanplus.
pub struct IpmiBmc {
    hostname: String,
    username: String,
    password: String,
}

impl IpmiBmc {
    pub fn new(hostname: &str, username: &str, password: &str) -> Self {
        IpmiBmc {
            hostname: hostname.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// The standard factory handed to [`crate::fence_node`].
    pub fn factory() -> Box<BmcFactory> {
        Box::new(|hostname, username, password| {
            Box::new(IpmiBmc::new(hostname, username, password))
        })
    }
}

impl Bmc for IpmiBmc {
    fn chassis(&self, op: PowerOp, timeout: Option<Duration>) -> Result<(bool, String), Error> {
        let command = format!(
            "/usr/bin/ipmitool -I lanplus -H {} -U {} -P {} chassis power {}",
            self.hostname,
            self.username,
            self.password,
            op.as_str()
        );
        let output = run_command(&command, timeout)?;
        Ok((output.success(), output.stdout.trim().to_owned()))
    }
}

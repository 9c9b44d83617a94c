//! Fencing of dead peers.
//!
//! A peer that misses enough keepalives is given six saving throws, then
//! power-cycled through its BMC. A confirmed-off chassis counts as a
//! successful fence even when the reboot itself failed; only an unknown
//! power state blocks recovery. After a successful fence the peer's VMs
//! are flushed to new owners according to the configured policy.

mod bmc;
mod fence;

pub use bmc::{Bmc, BmcFactory, IpmiBmc, PowerOp};
pub use fence::{
    classify_fence, fence_node, migrate_after_fence, migrate_from_fenced_node, suicide,
    verify_ipmi, FenceOutcome, FenceParams,
};

//! Host membership for indexflow deployments: the configured host list and
//! heartbeat-based liveness, exposed through the engine's
//! [`indexflow::MembershipDirectory`] trait.

pub mod config;
pub mod membership;

pub use config::{ClusterConfig, HostConfig};
pub use membership::{ClusterMembership, HostStatus};

//! lvexport - LVM volume provisioning and iSCSI export daemon
//!
//! Provisions logical volumes on a single host's LVM volume group, exports
//! them over iSCSI through the stgt target daemon, and fronts the whole
//! thing with the CSI v1 gRPC protocol so container orchestrators can
//! consume the storage.
//!
//! # Architecture
//!
//! ```text
//! CSI gRPC (Identity/Controller/Node) → domain (Lvm, Tgtd) → CommandRunner
//! ```
//!
//! All state lives in LVM metadata and the target daemon's running
//! configuration; the daemon itself is stateless and rebuilds its view by
//! querying the admin tools.
//!
//! # Modules
//!
//! - [`command`] - Privileged command execution with timeout
//! - [`config`] - Runtime configuration
//! - [`csi`] - CSI v1 gRPC services and access logging
//! - [`error`] - Error types and gRPC/HTTP status mapping
//! - [`export`] - iSCSI target lifecycle via tgtadm
//! - [`initiator`] - iSCSI initiator and filesystem helpers for the node side
//! - [`report`] - Decoders for LVM and tgtadm administrative output
//! - [`volume`] - Logical volume lifecycle via the LVM tools

pub mod command;
pub mod config;
pub mod csi;
pub mod error;
pub mod export;
pub mod initiator;
pub mod report;
pub mod volume;

// Re-export commonly used types
pub use command::{CommandRunner, SystemCommandRunner};
pub use config::Config;
pub use error::{Error, Result};
pub use export::Tgtd;
pub use volume::{Lvm, PoolStats, Volume};

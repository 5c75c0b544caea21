//! CSI v1 gRPC surface.
//!
//! Wire-compatible with the upstream Container Storage Interface: the
//! vendored proto keeps the original field numbers and the generated types
//! are served with tonic. Controller and Node both run in the same daemon;
//! the Node side assumes it runs on the host that consumes the storage.

pub mod access;
pub mod controller;
pub mod identity;
pub mod node;

#[allow(clippy::large_enum_variant)]
pub mod v1 {
    include!(concat!(env!("OUT_DIR"), "/csi.v1.rs"));
}

use crate::error::{Error, Result};

/// Reject empty required string fields up front.
pub(crate) fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("no {what}")));
    }
    Ok(())
}

/// Publish and stage operations only support mount-type capabilities.
pub(crate) fn require_mount_capability(
    cap: Option<&v1::VolumeCapability>,
) -> Result<v1::volume_capability::MountVolume> {
    let cap = cap.ok_or_else(|| Error::InvalidArgument("no capability".to_string()))?;
    match &cap.access_type {
        Some(v1::volume_capability::AccessType::Mount(m)) => Ok(m.clone()),
        _ => Err(Error::InvalidArgument(
            "mount capability required".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_rejects_empty() {
        assert!(require("", "volume id").is_err());
        assert!(require("vol1", "volume id").is_ok());
    }

    #[test]
    fn test_require_mount_capability() {
        assert!(require_mount_capability(None).is_err());

        let block = v1::VolumeCapability {
            access_type: Some(v1::volume_capability::AccessType::Block(
                v1::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        };
        assert!(require_mount_capability(Some(&block)).is_err());

        let mount = v1::VolumeCapability {
            access_type: Some(v1::volume_capability::AccessType::Mount(
                v1::volume_capability::MountVolume::default(),
            )),
            access_mode: None,
        };
        assert!(require_mount_capability(Some(&mount)).is_ok());
    }
}

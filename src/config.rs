//! Runtime configuration.
//!
//! Built once from the CLI arguments in `main` and passed by `Arc` into each
//! component constructor. Nothing reads ambient global state at call time.

use std::time::Duration;

/// Configuration shared by the volume domain, the export manager, and the
/// node-side helpers.
#[derive(Debug, Clone)]
pub struct Config {
    /// LVM volume group backing all managed volumes.
    pub vg: String,
    /// Network interfaces whose addresses are advertised to initiators.
    pub nics: Vec<String>,
    /// Privilege escalation prefix ("sudo", "doas", "su", or "none").
    pub become_method: String,
    /// tgtadm binary, possibly with leading wrapper words.
    pub tgtadm_bin: String,
    /// Backing store type passed to tgtadm when creating a LUN.
    pub tgt_bstype: String,
    /// Backing store options (tgtadm `bsopts`).
    pub tgt_bsopts: Option<String>,
    /// Backing store open flags (tgtadm `bsoflags`).
    pub tgt_bsoflags: Option<String>,
    /// Wrapper prefix for LVM report commands (e.g. "lvm" to use the
    /// multiplexed binary), if any.
    pub lvm_bin: Option<String>,
    /// iSCSI qualified name prefix; target names are `<iqn_base>:<suffix>`.
    pub iqn_base: String,
    /// Filesystem used when CreateVolume formats a fresh volume.
    pub default_fs: String,
    /// Deadline applied to every external command invocation.
    pub cmd_timeout: Duration,
    /// Node identifier reported by NodeGetInfo.
    pub node_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vg: "vg0".to_string(),
            nics: vec![],
            become_method: "sudo".to_string(),
            tgtadm_bin: "tgtadm".to_string(),
            tgt_bstype: "rdwr".to_string(),
            tgt_bsopts: None,
            tgt_bsoflags: None,
            lvm_bin: None,
            iqn_base: "iqn.2026-01.dev.lvexport".to_string(),
            default_fs: "ext4".to_string(),
            cmd_timeout: Duration::from_secs(10),
            node_id: String::new(),
        }
    }
}

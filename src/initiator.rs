//! iSCSI initiator and filesystem plumbing for the node side.
//!
//! Wraps `iscsiadm` for discovery, CHAP setup, login/logout and session
//! rescan, plus the mount/umount/blkid/resize tools needed to turn an
//! attached block device into a usable filesystem. Repeating an operation
//! that is already in effect (logged in, mounted) is not an error.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::command::CommandRunner;
use crate::error::{Error, Result};

/// Filesystem label length limits, in bytes.
const LABEL_LIMITS: [(&str, usize); 8] = [
    ("ext4", 16),
    ("ext3", 16),
    ("ext2", 16),
    ("xfs", 12),
    ("vfat", 11),
    ("exfat", 15),
    ("btrfs", 255),
    ("nilfs2", 80),
];

/// Truncate a label to what the filesystem can store.
pub fn truncate_label(filesystem: &str, label: &str) -> String {
    let limit = LABEL_LIMITS
        .iter()
        .find(|(fs, _)| *fs == filesystem)
        .map(|(_, n)| *n)
        .unwrap_or(16);
    label.chars().take(limit).collect()
}

/// Node-local attach/detach operations.
pub struct Initiator {
    runner: Arc<dyn CommandRunner>,
}

impl Initiator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn run(&self, argv: &[&str]) -> Result<String> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let out = self.runner.run(&argv, true).await?;
        Ok(out.stdout)
    }

    // -------------------------------------------------------------------------
    // iscsiadm
    // -------------------------------------------------------------------------

    /// SendTargets discovery against one portal.
    pub async fn discover(&self, portal: &str) -> Result<()> {
        self.run(&["iscsiadm", "-m", "discovery", "-t", "st", "-p", portal])
            .await?;
        Ok(())
    }

    /// Store CHAP credentials in the node record before login.
    pub async fn configure_chap(&self, target: &str, user: &str, passwd: &str) -> Result<()> {
        for (key, value) in [
            ("node.session.auth.authmethod", "CHAP"),
            ("node.session.auth.username", user),
            ("node.session.auth.password", passwd),
        ] {
            self.run(&[
                "iscsiadm", "-m", "node", "-T", target, "-o", "update", "-n", key, "-v", value,
            ])
            .await?;
        }
        Ok(())
    }

    /// Log in to a target. Logging in twice is success.
    #[instrument(skip(self))]
    pub async fn login(&self, target: &str) -> Result<()> {
        match self.run(&["iscsiadm", "-m", "node", "-T", target, "-l"]).await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { stderr, .. }) if stderr.contains("already") => {
                debug!(target, "already logged in");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Log out of a target, returning the portal of the closed session so
    /// its discovery record can be purged. No matching session is success.
    #[instrument(skip(self))]
    pub async fn logout(&self, target: &str) -> Result<Option<String>> {
        let stdout = match self.run(&["iscsiadm", "-m", "node", "-T", target, "-u"]).await {
            Ok(out) => out,
            Err(Error::CommandFailed { stderr, .. })
                if stderr.contains("No matching sessions") =>
            {
                debug!(target, "no session to log out");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(logout_portal(&stdout))
    }

    /// Drop a SendTargets discovery record.
    pub async fn discovery_delete(&self, portal: &str) -> Result<()> {
        self.run(&[
            "iscsiadm", "-m", "discoverydb", "-t", "st", "-p", portal, "-o", "delete",
        ])
        .await?;
        Ok(())
    }

    /// Rescan the session so the kernel notices a resized LUN.
    pub async fn rescan(&self, target: &str) -> Result<()> {
        self.run(&["iscsiadm", "-m", "node", "-T", target, "-R"]).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Filesystem
    // -------------------------------------------------------------------------

    /// Mount a filesystem by label. Mounting twice is success.
    #[instrument(skip(self))]
    pub async fn mount_by_label(&self, label: &str, target_path: &str) -> Result<()> {
        match self.run(&["mount", "-L", label, target_path]).await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { stderr, .. }) if stderr.contains("already mounted") => {
                info!(label, target_path, "already mounted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn umount(&self, target_path: &str) -> Result<()> {
        self.run(&["umount", target_path]).await?;
        Ok(())
    }

    /// Whether `target_path` is currently a mountpoint.
    pub fn is_mounted(&self, target_path: &str) -> bool {
        let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
            return false;
        };
        mounts
            .lines()
            .filter_map(|l| l.split_whitespace().nth(1))
            .any(|mp| mp == target_path)
    }

    /// Device path carrying the given filesystem label.
    pub async fn device_by_label(&self, label: &str) -> Result<String> {
        let stdout = self.run(&["blkid", "-L", label]).await?;
        let dev = stdout.trim();
        if dev.is_empty() {
            return Err(Error::NotFound(format!("no device with label: {label}")));
        }
        Ok(dev.to_string())
    }

    /// Grow the filesystem to fill its (already resized) device.
    pub async fn grow_filesystem(&self, device: &str) -> Result<()> {
        self.run(&["resize2fs", device]).await?;
        Ok(())
    }
}

/// Portal named in a successful logout line, e.g.
/// `Logout of [sid: 1, target: iqn..., portal: 10.0.0.5,3260] successful.`
fn logout_portal(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if !line.trim_end().ends_with("successful.") {
            continue;
        }
        let inner = line.split_once('[').map(|(_, rest)| rest)?;
        let inner = inner.split_once(']').map(|(body, _)| body)?;
        return inner.rsplit(char::is_whitespace).next().map(str::to_string);
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::mock::ScriptedRunner;

    #[test]
    fn test_truncate_label_limits() {
        assert_eq!(truncate_label("ext4", "a-rather-long-volume-name"), "a-rather-long-vo");
        assert_eq!(truncate_label("xfs", "a-rather-long-volume-name"), "a-rather-lon");
        assert_eq!(truncate_label("vfat", "a-rather-long-volume-name"), "a-rather-lo");
        assert_eq!(truncate_label("ext4", "short"), "short");
    }

    #[test]
    fn test_logout_portal_parses_successful_line() {
        let out = "Logging out of session [sid: 1, target: iqn.x:y, portal: 192.168.64.5,3260]\n\
                   Logout of [sid: 1, target: iqn.x:y, portal: 192.168.64.5,3260] successful.\n";
        assert_eq!(logout_portal(out).as_deref(), Some("192.168.64.5,3260"));
    }

    #[test]
    fn test_logout_portal_absent() {
        assert_eq!(logout_portal("nothing here\n"), None);
    }

    #[tokio::test]
    async fn test_login_tolerates_existing_session() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_fail(15, "iscsiadm: default: 1 session requested, but 1 already present.");
        Initiator::new(runner).login("iqn.x:y").await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_no_matching_session_is_ok() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_fail(21, "iscsiadm: No matching sessions found");
        let portal = Initiator::new(runner).logout("iqn.x:y").await.unwrap();
        assert!(portal.is_none());
    }

    #[tokio::test]
    async fn test_configure_chap_issues_three_updates() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("");
        runner.push_ok("");
        runner.push_ok("");
        Initiator::new(runner.clone())
            .configure_chap("iqn.x:y", "u", "p")
            .await
            .unwrap();
        assert_eq!(runner.call_count(), 3);
        let first = runner.call(0);
        assert!(first
            .windows(2)
            .any(|w| w == ["-n", "node.session.auth.authmethod"]));
        assert!(first.windows(2).any(|w| w == ["-v", "CHAP"]));
    }

    #[tokio::test]
    async fn test_mount_already_mounted_is_ok() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_fail(32, "mount: /mnt/x: /dev/sda already mounted on /mnt/x.");
        Initiator::new(runner)
            .mount_by_label("vol1", "/mnt/x")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_device_by_label_empty_is_not_found() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("\n");
        let err = Initiator::new(runner)
            .device_by_label("vol1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

//! Logical volume lifecycle on a single LVM volume group.
//!
//! All state lives in LVM metadata: user-facing volume names are carried as
//! `volname.<name>` tags, while the logical volume itself is named with a
//! random UUID so that LVM naming rules never constrain the user namespace.
//! Every query goes through the JSON report mode of the LVM tools except
//! pool statistics, which only `vgdisplay` exposes in one shot.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::command::CommandRunner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::report;

/// Tag prefix carrying the user-facing volume name.
const NAME_TAG_PREFIX: &str = "volname.";

/// Filesystems whose mkfs takes `-L` for the label.
const LABEL_DASH_L: [&str; 6] = ["ext4", "xfs", "exfat", "btrfs", "ntfs", "nilfs2"];
/// Filesystems whose mkfs takes `-n` for the label.
const LABEL_DASH_N: [&str; 1] = ["vfat"];

// =============================================================================
// Data model
// =============================================================================

/// One user-visible volume, resolved from an LVM report record.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// User-facing name, taken from the `volname.` tag.
    pub name: String,
    pub created: DateTime<FixedOffset>,
    /// Size in bytes.
    pub size: u64,
    /// Whether the backing device is currently open.
    pub used: bool,
    pub readonly: bool,
    /// True when the volume lives in a thin pool.
    pub thin: bool,
    /// LVM name of the snapshot origin, when this is a snapshot.
    pub parent: Option<String>,
    /// Internal LVM name (a UUID string).
    pub lvm_name: String,
    /// LVM's own volume UUID.
    pub lvm_id: String,
}

/// Aggregate usage of the volume group, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub volumes: u64,
}

// =============================================================================
// Lvm
// =============================================================================

/// Volume operations against one volume group.
pub struct Lvm {
    vg: String,
    lvm_bin: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl Lvm {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            vg: config.vg.clone(),
            lvm_bin: config.lvm_bin.clone(),
            runner,
        }
    }

    pub fn vg(&self) -> &str {
        &self.vg
    }

    fn tag(name: &str) -> String {
        format!("{NAME_TAG_PREFIX}{name}")
    }

    /// Volume names share the LVM-safe charset so they can ride in tags.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidArgument(format!("invalid name: {name}")));
        }
        Ok(())
    }

    fn validate_size(size: u64) -> Result<()> {
        if size == 0 || size % 512 != 0 {
            return Err(Error::InvalidArgument(format!("invalid size: {size}")));
        }
        Ok(())
    }

    fn argv(&self, cmd: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = self
            .lvm_bin
            .as_deref()
            .map(|b| b.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        out.extend(cmd.iter().map(|s| s.to_string()));
        out
    }

    async fn run(&self, cmd: &[&str]) -> Result<String> {
        let out = self.runner.run(&self.argv(cmd), true).await?;
        Ok(out.stdout)
    }

    async fn query(
        &self,
        kind: &str,
        filter: Option<&str>,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let list_cmd = format!("{kind}s");
        let fields = format!("{kind}_all");
        let mut cmd = vec![
            list_cmd.as_str(),
            "-o",
            fields.as_str(),
            "--reportformat",
            "json",
            "--unit",
            "b",
            "--nosuffix",
        ];
        if let Some(f) = filter {
            cmd.push("-S");
            cmd.push(f);
        }
        let stdout = self.run(&cmd).await?;
        report::parse_report(&stdout, kind)
    }

    /// Report record matching the volume's name tag, if exactly one exists.
    async fn get_raw(
        &self,
        name: &str,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
        let filter = format!("tags={}", Self::tag(name));
        let mut res = self.query("lv", Some(&filter)).await?;
        if res.len() == 1 {
            Ok(Some(res.remove(0)))
        } else {
            Ok(None)
        }
    }

    /// `vg/lv` form of the internal volume name.
    async fn full_name(&self, name: &str) -> Result<String> {
        let raw = self
            .get_raw(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("volume does not exist: {name}")))?;
        Ok(field(&raw, "lv_full_name").to_string())
    }

    /// Device path of a volume.
    pub async fn vol_to_path(&self, name: &str) -> Result<String> {
        Ok(format!("/dev/{}", self.full_name(name).await?))
    }

    /// Resolve a device path back to the user-facing name, if tagged.
    pub async fn path_to_vol(&self, path: &str) -> Result<Option<String>> {
        let prefix = format!("/dev/{}/", self.vg);
        if !path.starts_with(&prefix) {
            return Err(Error::InvalidArgument(format!(
                "invalid device path: {path}, vg={}",
                self.vg
            )));
        }
        let filter = format!("lv_path={path}");
        let res = self.query("lv", Some(&filter)).await?;
        let Some(raw) = res.first() else {
            return Err(Error::NotFound(format!("volume does not exist: {path}")));
        };
        Ok(tagged_name(field(raw, "lv_tags")))
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Create a linear volume of `size` bytes.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, size: u64) -> Result<Volume> {
        Self::validate_name(name)?;
        Self::validate_size(size)?;
        let lvname = Uuid::new_v4().to_string();
        let sizearg = format!("{size}b");
        let tag = Self::tag(name);
        let res = self
            .run(&[
                "lvcreate", "--size", &sizearg, &self.vg, "--name", &lvname, "--addtag", &tag,
            ])
            .await;
        if let Err(Error::CommandFailed { code, stderr, .. }) = &res {
            if *code == 3 && stderr.contains("Size is not a multiple") {
                return Err(Error::InvalidArgument(format!("invalid size: {size}")));
            }
        }
        res?;
        self.read(name)
            .await?
            .ok_or_else(|| Error::Internal(format!("created volume missing: {name}")))
    }

    /// Create a copy-on-write snapshot of `parent_lvm_name`.
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        name: &str,
        size: u64,
        parent_lvm_name: &str,
    ) -> Result<Volume> {
        Self::validate_name(name)?;
        Self::validate_size(size)?;
        let lvname = Uuid::new_v4().to_string();
        let sizearg = format!("{size}b");
        let tag = Self::tag(name);
        let dev = format!("/dev/{}/{}", self.vg, parent_lvm_name);
        self.run(&[
            "lvcreate", "--snapshot", "--size", &sizearg, "--name", &lvname, "--addtag", &tag,
            &dev,
        ])
        .await?;
        self.read(name)
            .await?
            .ok_or_else(|| Error::Internal(format!("created snapshot missing: {name}")))
    }

    /// Create a thin pool named `name` directly (no tag, not user-visible).
    #[instrument(skip(self))]
    pub async fn create_thinpool(&self, name: &str, size: u64) -> Result<String> {
        Self::validate_name(name)?;
        Self::validate_size(size)?;
        let sizearg = format!("{size}b");
        self.run(&["lvcreate", "--thinpool", name, "--size", &sizearg, &self.vg])
            .await?;
        Ok(format!("/dev/{}/{}", self.vg, name))
    }

    /// Create a thin volume of virtual size `size` inside `thinpool`.
    #[instrument(skip(self))]
    pub async fn create_thin(&self, name: &str, size: u64, thinpool: &str) -> Result<Volume> {
        Self::validate_name(name)?;
        Self::validate_size(size)?;
        let lvname = Uuid::new_v4().to_string();
        let sizearg = format!("{size}b");
        let tag = Self::tag(name);
        let pool = format!("{}/{}", self.vg, thinpool);
        self.run(&[
            "lvcreate",
            "--thin",
            "--virtualsize",
            &sizearg,
            "--name",
            &lvname,
            "--addtag",
            &tag,
            &pool,
        ])
        .await?;
        self.read(name)
            .await?
            .ok_or_else(|| Error::Internal(format!("created thin volume missing: {name}")))
    }

    /// Snapshot a thin volume; thin snapshots need explicit activation.
    #[instrument(skip(self))]
    pub async fn create_thin_snapshot(&self, name: &str, parent_lvm_name: &str) -> Result<Volume> {
        Self::validate_name(name)?;
        let lvname = Uuid::new_v4().to_string();
        let tag = Self::tag(name);
        let origin = format!("{}/{}", self.vg, parent_lvm_name);
        self.run(&[
            "lvcreate", "--snapshot", "--name", &lvname, "--addtag", &tag, &origin,
        ])
        .await?;
        let dev = format!("/dev/{}/{}", self.vg, lvname);
        self.run(&[
            "lvchange",
            "--activate",
            "y",
            &dev,
            "--ignoreactivationskip",
        ])
        .await?;
        self.read(name)
            .await?
            .ok_or_else(|| Error::Internal(format!("created thin snapshot missing: {name}")))
    }

    /// Merge a snapshot back into its origin and return the origin volume.
    #[instrument(skip(self))]
    pub async fn rollback_snapshot(&self, name: &str) -> Result<Option<Volume>> {
        let parent = self.get_parent(name).await?;
        let full = self.full_name(name).await?;
        self.run(&["lvconvert", "--merge", &full]).await?;
        match parent {
            Some(p) => self.read_by_lvm_name(&p).await,
            None => Ok(None),
        }
    }

    /// LVM name of the snapshot origin, when the volume is a snapshot.
    pub async fn get_parent(&self, name: &str) -> Result<Option<String>> {
        let Some(raw) = self.get_raw(name).await? else {
            return Ok(None);
        };
        let origin = field(&raw, "origin");
        Ok((!origin.is_empty()).then(|| origin.to_string()))
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Remove a volume. Absent volumes are treated as already deleted.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let Some(raw) = self.get_raw(name).await? else {
            debug!(name, "volume already absent");
            return Ok(());
        };
        let full = field(&raw, "lv_full_name").to_string();
        match self.run(&["lvremove", &full, "--yes"]).await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { code: 5, stderr, .. })
                if stderr.contains("Failed to find") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Flip the volume between read-only and read-write.
    #[instrument(skip(self))]
    pub async fn set_readonly(&self, name: &str, readonly: bool) -> Result<()> {
        let full = self.full_name(name).await?;
        let perm = if readonly { "r" } else { "rw" };
        self.run(&["lvchange", "--permission", perm, &full]).await?;
        Ok(())
    }

    /// Resize to `newsize` bytes.
    #[instrument(skip(self))]
    pub async fn resize(&self, name: &str, newsize: u64) -> Result<()> {
        Self::validate_size(newsize)?;
        let full = self.full_name(name).await?;
        let sizearg = format!("{newsize}b");
        self.run(&["lvresize", "--size", &sizearg, &full, "--yes"])
            .await?;
        Ok(())
    }

    /// Make a filesystem on the volume. The mkfs tool must be on PATH.
    #[instrument(skip(self))]
    pub async fn format(&self, name: &str, filesystem: &str, label: Option<&str>) -> Result<()> {
        let mkfs = format!("mkfs.{filesystem}");
        if !tool_on_path(&mkfs) {
            warn!(tool = %mkfs, "formatting tool not found");
            return Err(Error::NotImplemented(format!(
                "unsupported filesystem: {filesystem}"
            )));
        }
        let label_flag = if LABEL_DASH_L.contains(&filesystem) {
            "-L"
        } else if LABEL_DASH_N.contains(&filesystem) {
            "-n"
        } else {
            warn!(filesystem, "no such filesystem");
            return Err(Error::NotImplemented(format!(
                "unsupported filesystem: {filesystem}"
            )));
        };
        let path = self.vol_to_path(name).await?;
        let label = label.unwrap_or(name);
        self.run(&[&mkfs, label_flag, label, &path]).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// All user-visible volumes in the group.
    pub async fn list(&self) -> Result<Vec<Volume>> {
        let raws = self.query("lv", None).await?;
        Ok(raws.iter().filter_map(volume_from_record).collect())
    }

    /// One volume by user-facing name.
    pub async fn read(&self, name: &str) -> Result<Option<Volume>> {
        let Some(raw) = self.get_raw(name).await? else {
            return Ok(None);
        };
        Ok(volume_from_record(&raw))
    }

    /// One volume by its internal LVM name.
    async fn read_by_lvm_name(&self, lvm_name: &str) -> Result<Option<Volume>> {
        let filter = format!("lv_name={lvm_name}");
        let res = self.query("lv", Some(&filter)).await?;
        Ok(res.first().and_then(volume_from_record))
    }

    /// Aggregate capacity of the volume group.
    ///
    /// `vgdisplay` is the only tool that reports extent accounting in one
    /// invocation; its fixed-column output uses a 21-character key field.
    #[instrument(skip(self))]
    pub async fn pool_stats(&self) -> Result<PoolStats> {
        let stdout = self.run(&["vgdisplay", &self.vg, "--units", "b"]).await?;
        let records = report::parse_columns(&stdout, 2, 21);
        let rec = records
            .iter()
            .find(|r| r.get("VG Name").map(String::as_str) == Some(self.vg.as_str()))
            .ok_or_else(|| Error::NotFound(format!("pool not found: {}", self.vg)))?;
        let pe_size: u64 = rec
            .get("PE Size")
            .map(String::as_str)
            .and_then(|v| v.strip_suffix(" B").unwrap_or(v).parse().ok())
            .ok_or_else(|| Error::Internal("bad PE Size".to_string()))?;
        let total_pe: u64 = rec
            .get("Total PE")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Internal("bad Total PE".to_string()))?;
        let alloc_pe: u64 = rec
            .get("Alloc PE / Size")
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Internal("bad Alloc PE".to_string()))?;
        let free_pe: u64 = rec
            .get("Free  PE / Size")
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Internal("bad Free PE".to_string()))?;
        let volumes: u64 = rec
            .get("Cur LV")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(PoolStats {
            total: pe_size * total_pe,
            used: pe_size * alloc_pe,
            free: pe_size * free_pe,
            volumes,
        })
    }
}

// =============================================================================
// Record helpers
// =============================================================================

fn field<'a>(rec: &'a serde_json::Map<String, serde_json::Value>, key: &str) -> &'a str {
    rec.get(key).and_then(serde_json::Value::as_str).unwrap_or("")
}

fn tagged_name(tags: &str) -> Option<String> {
    tags.split(',')
        .find_map(|t| t.strip_prefix(NAME_TAG_PREFIX))
        .map(str::to_string)
}

/// Resolve a raw report record into a [`Volume`].
///
/// Records with no device path (thin pools) or not currently active are
/// invisible to callers.
fn volume_from_record(rec: &serde_json::Map<String, serde_json::Value>) -> Option<Volume> {
    if field(rec, "lv_path").is_empty() {
        debug!(lv = field(rec, "lv_name"), "no device");
        return None;
    }
    if field(rec, "lv_active") != "active" {
        debug!(lv = field(rec, "lv_name"), "not active");
        return None;
    }
    let created =
        DateTime::parse_from_str(field(rec, "lv_time"), "%Y-%m-%d %H:%M:%S %z").ok()?;
    let size: u64 = field(rec, "lv_size").parse().ok()?;
    let origin = field(rec, "origin");
    let name = tagged_name(field(rec, "lv_tags"))
        .unwrap_or_else(|| field(rec, "lv_name").to_string());
    Some(Volume {
        name,
        created,
        size,
        used: !field(rec, "lv_device_open").is_empty(),
        readonly: field(rec, "lv_permissions") != "writeable",
        thin: !field(rec, "pool_lv").is_empty(),
        parent: (!origin.is_empty()).then(|| origin.to_string()),
        lvm_name: field(rec, "lv_name").to_string(),
        lvm_id: field(rec, "lv_uuid").to_string(),
    })
}

fn tool_on_path(tool: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(tool).is_file())
}

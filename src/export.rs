//! iSCSI target lifecycle through the stgt administration tool.
//!
//! Each exported volume gets its own target with a single LUN (LUN 0 is the
//! controller LUN that stgt manages itself), a generated CHAP account and an
//! initiator-address ACL. Target state is never cached; every compound
//! operation re-reads `tgtadm --op show` and works off the parsed tree.

use std::path::Path;
use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, instrument, warn};

use crate::command::{CommandOutput, CommandRunner};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::report::{parse_tree, Tree, TreeMap};

const LLD: &str = "iscsi";
/// Exports always carry the volume at LUN 1; LUN 0 is the controller.
const EXPORT_LUN: u32 = 1;
const DEFAULT_PORT: u16 = 3260;

// =============================================================================
// Data model
// =============================================================================

/// One initiator session on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedClient {
    /// Initiator IQN, without the alias suffix.
    pub initiator: String,
    /// Source addresses of the nexus connections.
    pub addresses: Vec<String>,
}

/// A target as seen in the live daemon state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub protocol: String,
    pub tid: u32,
    pub targetname: String,
    pub connected: Vec<ConnectedClient>,
    /// Backing store paths of the disk LUNs.
    pub volumes: Vec<String>,
    /// CHAP account names bound to the target.
    pub users: Vec<String>,
    /// Initiator addresses allowed to connect.
    pub acl: Vec<String>,
}

/// Everything an initiator needs to attach a fresh export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub protocol: String,
    /// `host:port` portal addresses.
    pub addresses: Vec<String>,
    pub targetname: String,
    pub tid: u32,
    pub user: String,
    pub passwd: String,
    pub lun: u32,
    pub acl: Vec<String>,
}

// =============================================================================
// Tgtd
// =============================================================================

/// Target daemon operations.
pub struct Tgtd {
    tgtadm_bin: String,
    bstype: String,
    bsopts: Option<String>,
    bsoflags: Option<String>,
    iqn_base: String,
    nics: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl Tgtd {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tgtadm_bin: config.tgtadm_bin.clone(),
            bstype: config.tgt_bstype.clone(),
            bsopts: config.tgt_bsopts.clone(),
            bsoflags: config.tgt_bsoflags.clone(),
            iqn_base: config.iqn_base.clone(),
            nics: config.nics.clone(),
            runner,
        }
    }

    async fn tgtadm(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut argv: Vec<String> = self
            .tgtadm_bin
            .split_whitespace()
            .map(str::to_string)
            .collect();
        argv.extend(args.iter().map(|s| s.to_string()));
        self.runner.run(&argv, true).await
    }

    // -------------------------------------------------------------------------
    // Target primitives
    // -------------------------------------------------------------------------

    pub async fn target_create(&self, tid: u32, name: &str) -> Result<()> {
        self.tgtadm(&[
            "--lld", LLD, "--mode", "target", "--op", "new", "--tid", &tid.to_string(),
            "--targetname", name,
        ])
        .await?;
        Ok(())
    }

    pub async fn target_delete(&self, tid: u32, force: bool) -> Result<()> {
        let tid = tid.to_string();
        let mut args = vec!["--lld", LLD, "--mode", "target", "--op", "delete"];
        if force {
            args.push("--force");
        }
        args.extend(["--tid", &tid]);
        self.tgtadm(&args).await?;
        Ok(())
    }

    /// Parsed `--op show` tree of all targets.
    pub async fn target_list(&self) -> Result<TreeMap> {
        let out = self
            .tgtadm(&["--lld", LLD, "--mode", "target", "--op", "show"])
            .await?;
        Ok(parse_tree(&out.stdout))
    }

    pub async fn target_bind_address(&self, tid: u32, addr: &str) -> Result<()> {
        self.tgtadm(&[
            "--lld", LLD, "--mode", "target", "--op", "bind", "--tid", &tid.to_string(),
            "--initiator-address", addr,
        ])
        .await?;
        Ok(())
    }

    pub async fn target_unbind_address(&self, tid: u32, addr: &str) -> Result<()> {
        self.tgtadm(&[
            "--lld", LLD, "--mode", "target", "--op", "unbind", "--tid", &tid.to_string(),
            "--initiator-address", addr,
        ])
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // LUN primitives
    // -------------------------------------------------------------------------

    pub async fn lun_create(
        &self,
        tid: u32,
        lun: u32,
        path: &str,
        readonly: bool,
    ) -> Result<()> {
        let tid = tid.to_string();
        let lun = lun.to_string();
        let mut args = vec![
            "--lld", LLD, "--mode", "logicalunit", "--op", "new", "--tid", &tid, "--lun", &lun,
            "--backing-store", path, "--bstype", &self.bstype,
        ];
        if let Some(opts) = &self.bsopts {
            args.extend(["--bsopts", opts]);
        }
        if let Some(flags) = &self.bsoflags {
            args.extend(["--bsoflags", flags]);
        }
        if readonly {
            args.extend(["--params", "readonly=1"]);
        }
        self.tgtadm(&args).await?;
        Ok(())
    }

    pub async fn lun_delete(&self, tid: u32, lun: u32) -> Result<()> {
        self.tgtadm(&[
            "--lld", LLD, "--mode", "logicalunit", "--op", "delete", "--tid", &tid.to_string(),
            "--lun", &lun.to_string(),
        ])
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Account primitives
    // -------------------------------------------------------------------------

    pub async fn account_create(&self, user: &str, password: &str) -> Result<()> {
        self.tgtadm(&[
            "--lld", LLD, "--mode", "account", "--op", "new", "--user", user, "--password",
            password,
        ])
        .await?;
        Ok(())
    }

    pub async fn account_delete(&self, user: &str) -> Result<()> {
        self.tgtadm(&["--lld", LLD, "--mode", "account", "--op", "delete", "--user", user])
            .await?;
        Ok(())
    }

    pub async fn account_bind(&self, tid: u32, user: &str) -> Result<()> {
        self.tgtadm(&[
            "--lld", LLD, "--mode", "account", "--op", "bind", "--tid", &tid.to_string(),
            "--user", user,
        ])
        .await?;
        Ok(())
    }

    pub async fn account_unbind(&self, tid: u32, user: &str) -> Result<()> {
        self.tgtadm(&[
            "--lld", LLD, "--mode", "account", "--op", "unbind", "--tid", &tid.to_string(),
            "--user", user,
        ])
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // System and portals
    // -------------------------------------------------------------------------

    pub async fn sys_show(&self) -> Result<TreeMap> {
        let out = self.tgtadm(&["--mode", "sys", "--op", "show"]).await?;
        Ok(parse_tree(&out.stdout))
    }

    /// True when the daemon reports `System: State: ready`.
    pub async fn system_ready(&self) -> Result<bool> {
        let sys = self.sys_show().await?;
        Ok(sys
            .get("System")
            .and_then(|s| s.get("State"))
            .and_then(Tree::as_str)
            == Some("ready"))
    }

    /// Portal addresses in `host:port,flags` form, flags stripped.
    pub async fn portal_list(&self) -> Result<Vec<String>> {
        let out = self
            .tgtadm(&["--lld", LLD, "--mode", "portal", "--op", "show"])
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|l| l.strip_prefix("Portal:"))
            .map(|l| l.trim().trim_end_matches(",1").to_string())
            .collect())
    }

    /// Portal addresses an initiator can actually reach.
    ///
    /// Wildcard portals are expanded to the addresses of the configured
    /// interfaces; link-local v6 addresses are never advertised.
    #[instrument(skip(self))]
    pub async fn myaddress(&self) -> Result<Vec<String>> {
        let portals = self.portal_list().await?;
        let (v4, v6) = interface_addresses(&self.nics)?;
        debug!(?v4, ?v6, "interface addresses");
        Ok(expand_portals(&portals, &v4, &v6))
    }

    // -------------------------------------------------------------------------
    // Configuration dump/restore
    // -------------------------------------------------------------------------

    /// Current target configuration in tgt-admin dump format.
    pub async fn dump(&self) -> Result<String> {
        let argv = vec!["tgt-admin".to_string(), "--dump".to_string()];
        let out = self.runner.run(&argv, true).await?;
        Ok(out.stdout)
    }

    /// Replay a dumped configuration into the running daemon.
    pub async fn restore(&self, data: &str) -> Result<String> {
        let mut tf = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut tf, data.as_bytes())?;
        std::io::Write::flush(&mut tf)?;
        let path = tf.path().to_string_lossy().to_string();
        let argv = vec![
            "tgt-admin".to_string(),
            "-c".to_string(),
            path,
            "-e".to_string(),
        ];
        let out = self.runner.run(&argv, true).await?;
        Ok(out.stdout)
    }

    // -------------------------------------------------------------------------
    // Compound operations
    // -------------------------------------------------------------------------

    /// All targets with their sessions, LUNs, accounts and ACLs.
    #[instrument(skip(self))]
    pub async fn export_list(&self) -> Result<Vec<ExportTarget>> {
        let tree = self.target_list().await?;
        let empty = TreeMap::new();
        let mut res = Vec::new();
        for (key, entry) in tree.iter() {
            let Some(tid) = key.strip_prefix("Target ").and_then(|t| t.parse().ok()) else {
                continue;
            };
            // a target printed without sections parses as a bare leaf
            // holding its name
            let Some(name) = target_name(entry) else {
                continue;
            };
            let node = entry.as_node().unwrap_or(&empty);
            res.push(ExportTarget {
                protocol: LLD.to_string(),
                tid,
                targetname: name.to_string(),
                connected: connected_clients(node),
                volumes: disk_luns(node)
                    .into_iter()
                    .filter_map(|(_, lun)| {
                        lun.get("Backing store path").and_then(Tree::as_str).map(str::to_string)
                    })
                    .collect(),
                users: section_keys(node, "Account information"),
                acl: section_keys(node, "ACL information"),
            });
        }
        Ok(res)
    }

    pub async fn get_export_by_path(&self, path: &str) -> Result<Option<ExportTarget>> {
        let res = self.export_list().await?;
        Ok(res.into_iter().find(|t| t.volumes.iter().any(|v| v == path)))
    }

    pub async fn get_export_by_name(&self, targetname: &str) -> Result<Option<ExportTarget>> {
        let res = self.export_list().await?;
        Ok(res.into_iter().find(|t| t.targetname == targetname))
    }

    /// Export a block device as a new single-LUN target.
    #[instrument(skip(self))]
    pub async fn export_volume(
        &self,
        path: &str,
        acl: &[String],
        readonly: bool,
    ) -> Result<ExportInfo> {
        if !Path::new(path).exists() {
            return Err(Error::NotFound(format!("device does not exist: {path}")));
        }
        let tree = self.target_list().await?;
        let max_tid = tree
            .keys()
            .filter_map(|k| k.strip_prefix("Target "))
            .filter_map(|t| t.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        let tid = max_tid + 1;
        let name = format!("{}:{}", self.iqn_base, token_hex(10));
        let user = token_hex(10);
        let passwd = token_hex(20);

        self.target_create(tid, &name).await?;
        self.lun_create(tid, EXPORT_LUN, path, readonly).await?;
        self.account_create(&user, &passwd).await?;
        self.account_bind(tid, &user).await?;
        for addr in acl {
            self.target_bind_address(tid, addr).await?;
        }
        let addresses = self.myaddress().await?;
        Ok(ExportInfo {
            protocol: LLD.to_string(),
            addresses,
            targetname: name,
            tid,
            user,
            passwd,
            lun: EXPORT_LUN,
            acl: acl.to_vec(),
        })
    }

    /// Tear down a target by name.
    ///
    /// Refuses while initiators are connected unless `force` is set, in
    /// which case teardown errors are logged and the target is deleted
    /// anyway.
    #[instrument(skip(self))]
    pub async fn unexport_volume(&self, targetname: &str, force: bool) -> Result<()> {
        let tree = self.target_list().await?;
        let empty = TreeMap::new();
        for (key, entry) in tree.iter() {
            if target_name(entry) != Some(targetname) {
                continue;
            }
            let node = entry.as_node().unwrap_or(&empty);
            let tid: u32 = key
                .strip_prefix("Target ")
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| Error::Internal(format!("bad target key: {key}")))?;
            let clients = connected_clients(node);
            if !clients.is_empty() {
                warn!(targetname, ?clients, "clients connected");
                if !force {
                    let addrs: Vec<&str> = clients
                        .iter()
                        .flat_map(|c| c.addresses.iter().map(String::as_str))
                        .collect();
                    return Err(Error::AlreadyInUse(format!(
                        "client connected: {addrs:?}"
                    )));
                }
            }
            if let Err(e) = self.teardown(tid, node).await {
                if !force {
                    return Err(e);
                }
                warn!(targetname, error = %e, "teardown failed, forcing delete");
            }
            return self.target_delete(tid, force).await;
        }
        Err(Error::NotFound(format!("target not found: {targetname}")))
    }

    async fn teardown(&self, tid: u32, node: &TreeMap) -> Result<()> {
        for user in section_keys(node, "Account information") {
            self.account_unbind(tid, &user).await?;
            self.account_delete(&user).await?;
        }
        for addr in section_keys(node, "ACL information") {
            self.target_unbind_address(tid, &addr).await?;
        }
        // highest LUN first; the controller LUN stays with the target
        let mut luns = disk_luns(node);
        luns.sort_by(|a, b| b.0.cmp(&a.0));
        for (lun, _) in luns {
            self.lun_delete(tid, lun).await?;
        }
        Ok(())
    }

    /// Re-attach a LUN in place so the daemon picks up device size changes.
    /// `NotFound` when the target or LUN is not live.
    #[instrument(skip(self))]
    pub async fn refresh_volume(&self, tid: u32, lun: u32) -> Result<()> {
        let tree = self.target_list().await?;
        let key = format!("Target {tid}");
        let Some(node) = tree.get(&key).and_then(Tree::as_node) else {
            return Err(Error::NotFound(format!("target not found: {tid}")));
        };
        let lun_key = format!("LUN {lun}");
        let Some(info) = node.get("LUN information").and_then(|l| l.get(&lun_key)) else {
            return Err(Error::NotFound(format!("lun not found: {tid}/{lun}")));
        };
        self.reattach(tid, lun, info).await
    }

    /// Like [`refresh_volume`](Self::refresh_volume) but keyed by the
    /// backing store path, across all targets. `NotFound` when no export
    /// carries the path.
    #[instrument(skip(self))]
    pub async fn refresh_volume_by_path(&self, path: &str) -> Result<()> {
        let tree = self.target_list().await?;
        let mut refreshed = 0;
        for (key, entry) in tree.iter() {
            let Some(tid) = key.strip_prefix("Target ").and_then(|t| t.parse().ok()) else {
                continue;
            };
            let Some(node) = entry.as_node() else {
                continue;
            };
            for (lun, info) in disk_luns(node) {
                if info.get("Backing store path").and_then(Tree::as_str) == Some(path) {
                    self.reattach(tid, lun, &Tree::Node(info.clone())).await?;
                    refreshed += 1;
                }
            }
        }
        if refreshed == 0 {
            return Err(Error::NotFound(format!("path not exported: {path}")));
        }
        Ok(())
    }

    async fn reattach(&self, tid: u32, lun: u32, info: &Tree) -> Result<()> {
        let Some(path) = info.get("Backing store path").and_then(Tree::as_str) else {
            return Ok(());
        };
        let path = path.to_string();
        let readonly = info.get("Readonly").and_then(Tree::as_str) == Some("Yes");
        debug!(tid, lun, path, readonly, "reattaching lun");
        self.lun_delete(tid, lun).await?;
        self.lun_create(tid, lun, &path, readonly).await
    }
}

// =============================================================================
// Tree helpers
// =============================================================================

/// Target name from a show-tree entry: nested under `name` for sectioned
/// targets, the leaf value itself for targets with no sections.
fn target_name(entry: &Tree) -> Option<&str> {
    entry
        .get("name")
        .and_then(Tree::as_str)
        .or_else(|| entry.as_str())
}

fn section_keys(node: &TreeMap, section: &str) -> Vec<String> {
    node.get(section)
        .and_then(Tree::as_node)
        .map(|m| m.keys().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Non-controller LUNs of a target, with their numeric ids.
fn disk_luns(node: &TreeMap) -> Vec<(u32, TreeMap)> {
    let Some(luns) = node.get("LUN information").and_then(Tree::as_node) else {
        return Vec::new();
    };
    let mut res = Vec::new();
    for (key, entry) in luns.iter() {
        let Some(info) = entry.as_node() else {
            continue;
        };
        if info.get("Type").and_then(Tree::as_str) == Some("controller") {
            continue;
        }
        let Some(id) = key.strip_prefix("LUN ").and_then(|i| i.parse().ok()) else {
            continue;
        };
        res.push((id, info.clone()));
    }
    res
}

fn connected_clients(node: &TreeMap) -> Vec<ConnectedClient> {
    let Some(nexus) = node.get("I_T nexus information").and_then(Tree::as_node) else {
        return Vec::new();
    };
    let mut res = Vec::new();
    for (_, entry) in nexus.iter() {
        let Some(info) = entry.as_node() else {
            continue;
        };
        let initiator = info
            .get("Initiator")
            .and_then(Tree::as_str)
            .map(|s| s.split_whitespace().next().unwrap_or(s).to_string())
            .unwrap_or_default();
        let addresses = info
            .iter()
            .filter(|(k, _)| k.starts_with("Connection "))
            .filter_map(|(_, conn)| {
                conn.get("IP Address").and_then(Tree::as_str).map(str::to_string)
            })
            .collect();
        res.push(ConnectedClient {
            initiator,
            addresses,
        });
    }
    res
}

// =============================================================================
// Addresses
// =============================================================================

fn token_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Non-link-local v4 and v6 addresses of the named interfaces.
fn interface_addresses(nics: &[String]) -> Result<(Vec<String>, Vec<String>)> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Internal(format!("getifaddrs: {e}")))?;
    for ifa in addrs {
        if !nics.iter().any(|n| n == &ifa.interface_name) {
            continue;
        }
        let Some(addr) = ifa.address else {
            continue;
        };
        if let Some(sin) = addr.as_sockaddr_in() {
            v4.push(sin.ip().to_string());
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            if sin6.scope_id() != 0 {
                continue;
            }
            v6.push(sin6.ip().to_string());
        }
    }
    Ok((v4, v6))
}

fn split_hostport(portal: &str) -> (String, u16) {
    if let Some(rest) = portal.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT);
            return (host.to_string(), port);
        }
    }
    match portal.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (
            host.to_string(),
            port.parse().unwrap_or(DEFAULT_PORT),
        ),
        _ => (portal.to_string(), DEFAULT_PORT),
    }
}

/// Expand wildcard portals to concrete `host:port` addresses; portals
/// already bound to a concrete host pass through unchanged.
fn expand_portals(portals: &[String], v4: &[String], v6: &[String]) -> Vec<String> {
    let mut res = Vec::new();
    for portal in portals {
        let (host, port) = split_hostport(portal);
        match host.as_str() {
            "0.0.0.0" => res.extend(v4.iter().map(|a| format!("{a}:{port}"))),
            "::" => res.extend(
                v6.iter()
                    .filter(|a| !a.contains('%'))
                    .map(|a| format!("[{a}]:{port}")),
            ),
            _ => res.push(portal.clone()),
        }
    }
    res
}

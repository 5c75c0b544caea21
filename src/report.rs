//! Decoders for the administrative output of the storage and export engines.
//!
//! Three formats:
//! - fixed-column records from the legacy LVM display commands
//!   (`pvdisplay`/`vgdisplay`/`lvdisplay`),
//! - the indentation tree printed by `tgtadm --op show`,
//! - the JSON report emitted by report-capable LVM invocations
//!   (`--reportformat json`), preferred whenever available.
//!
//! The text decoders are pure and total: tool output drifts across versions,
//! so malformed or unexpected lines are dropped instead of raising.

use serde_json::Value;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Fixed-column format
// ---------------------------------------------------------------------------

/// Record type produced by [`parse_columns`].
pub type ColumnRecord = std::collections::HashMap<String, String>;

/// Parse `--- label ---` separated fixed-column records.
///
/// Keys occupy `width` characters starting at column `indent`; the value
/// starts one column later. Lines that are too short, or that have no space
/// at the key/value boundary, are structural and skipped. A line with an
/// empty key portion continues the previous key's value, space-joined.
pub fn parse_columns(text: &str, indent: usize, width: usize) -> Vec<ColumnRecord> {
    let mut records = Vec::new();
    let mut current = ColumnRecord::new();
    let mut last_key: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("---") {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            last_key = None;
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= indent + width || chars[indent + width] != ' ' {
            continue;
        }
        if chars[..indent].iter().any(|c| !c.is_whitespace()) {
            continue;
        }
        let key: String = chars[indent..indent + width].iter().collect();
        let key = key.trim();
        let value: String = chars[indent + width + 1..].iter().collect();
        let value = value.trim();
        if key.is_empty() {
            // continuation of a wrapped value
            if let Some(prev) = &last_key {
                if let Some(v) = current.get_mut(prev) {
                    v.push(' ');
                    v.push_str(value);
                }
            }
            continue;
        }
        current.insert(key.to_string(), value.to_string());
        last_key = Some(key.to_string());
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

// ---------------------------------------------------------------------------
// Tree format
// ---------------------------------------------------------------------------

/// One node of the tree dump: either a scalar (possibly empty) or a nested
/// ordered mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Leaf(Option<String>),
    Node(TreeMap),
}

impl Tree {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Tree::Leaf(v) => v.as_deref(),
            Tree::Node(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<&TreeMap> {
        match self {
            Tree::Node(m) => Some(m),
            Tree::Leaf(_) => None,
        }
    }

    /// Child lookup on a node; `None` for leaves and missing keys.
    pub fn get(&self, key: &str) -> Option<&Tree> {
        self.as_node().and_then(|m| m.get(key))
    }
}

/// Insertion-ordered string map; sibling order in the dump is preserved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TreeMap(Vec<(String, Tree)>);

impl TreeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Tree> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Tree> {
        self.0.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Mutable handle for `key`, inserting an empty leaf if absent.
    fn entry_mut(&mut self, key: &str) -> &mut Tree {
        let idx = match self.0.iter().position(|(k, _)| k == key) {
            Some(i) => i,
            None => {
                self.0.push((key.to_string(), Tree::Leaf(None)));
                self.0.len() - 1
            }
        };
        &mut self.0[idx].1
    }

    pub fn insert(&mut self, key: String, value: Tree) {
        if let Some(slot) = self.get_mut(&key) {
            *slot = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tree)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct TreeLine {
    level: usize,
    key: String,
    value: Option<String>,
}

/// Keys that repeat among siblings; their numeric identifier is appended to
/// keep them distinct, and surfaces again as the nested record's `name`.
const REPEATED_KEYS: [&str; 4] = ["LUN", "I_T nexus", "Connection", "Session"];

fn classify(line: &str) -> Option<TreeLine> {
    let indent = line.len() - line.trim_start().len();
    let rest = &line[indent..];
    if rest.trim().is_empty() {
        return None;
    }
    let level = indent / 4;

    if line.contains(" (") {
        let (key, tail) = rest.split_once('(')?;
        let value = tail.trim_matches(|c| c == ' ' || c == ')');
        return Some(TreeLine {
            level,
            key: key.trim().to_string(),
            value: (!value.is_empty()).then(|| value.to_string()),
        });
    }
    if rest.contains(':') || rest.contains('=') {
        let (k, v) = rest
            .split_once(':')
            .or_else(|| rest.split_once('='))?;
        let key = k.trim();
        let value = v.trim();
        let value = (!value.is_empty()).then(|| value.to_string());
        let key = if REPEATED_KEYS.contains(&key) {
            format!("{} {}", key, value.as_deref().unwrap_or(""))
        } else {
            key.to_string()
        };
        return Some(TreeLine {
            level,
            key,
            value,
        });
    }
    Some(TreeLine {
        level,
        key: rest.trim().to_string(),
        value: None,
    })
}

/// Parse the indentation tree printed by the target administration tool.
///
/// Indentation is quantized in 4-column steps; descending one level nests
/// into the previous key's entry. A leaf that acquires children keeps its
/// scalar under `name` in the new node.
pub fn parse_tree(text: &str) -> TreeMap {
    let mut root = TreeMap::new();
    let mut levels: Vec<String> = Vec::new();

    for line in text.lines() {
        let Some(node) = classify(line) else {
            continue;
        };
        levels.truncate(node.level);

        let mut target = &mut root;
        for key in levels.iter() {
            let entry = target.entry_mut(key);
            if let Tree::Leaf(v) = entry {
                let mut inner = TreeMap::new();
                if let Some(v) = v.take() {
                    inner.insert("name".to_string(), Tree::Leaf(Some(v)));
                }
                *entry = Tree::Node(inner);
            }
            target = match entry {
                Tree::Node(m) => m,
                Tree::Leaf(_) => unreachable!(),
            };
        }
        levels.push(node.key.clone());
        target.insert(node.key, Tree::Leaf(node.value));
    }
    root
}

// ---------------------------------------------------------------------------
// JSON report format
// ---------------------------------------------------------------------------

/// Flatten `{"report": [{"<kind>": [...]}]}` into one ordered sequence.
pub fn parse_report(stdout: &str, kind: &str) -> Result<Vec<serde_json::Map<String, Value>>> {
    let value: Value = serde_json::from_str(stdout)
        .map_err(|e| Error::Internal(format!("invalid report json: {e}")))?;
    let mut out = Vec::new();
    if let Some(reports) = value.get("report").and_then(Value::as_array) {
        for report in reports {
            if let Some(items) = report.get(kind).and_then(Value::as_array) {
                for item in items {
                    if let Some(obj) = item.as_object() {
                        out.push(obj.clone());
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VGDISPLAY: &str = "\
  --- Volume group ---
  VG Name               vg0
  System ID
  Format                lvm2
  VG Size               <63.50 GiB
  PE Size               4.00 MiB
  Total PE              16255
  Alloc PE / Size       16255 / <63.50 GiB
  Free  PE / Size       0 / 0
  VG UUID               hPuYd4-QEoi-RcvL-Jdr5-XLrf-urQm-hgybLl
";

    #[test]
    fn test_columns_single_record() {
        let res = parse_columns(VGDISPLAY, 2, 21);
        assert_eq!(res.len(), 1);
        let rec = &res[0];
        assert_eq!(rec["VG Name"], "vg0");
        assert_eq!(rec["PE Size"], "4.00 MiB");
        assert_eq!(rec["Alloc PE / Size"], "16255 / <63.50 GiB");
        assert_eq!(rec["Free  PE / Size"], "0 / 0");
        // too short, no value column: structural, dropped
        assert!(!rec.contains_key("System ID"));
    }

    #[test]
    fn test_columns_wrapped_value_joins() {
        let input = "\
  --- Logical volume ---
  LV Path                /dev/vg0/vol001
  LV Name                vol001
  LV Creation host, time lima-server, 2025-09-06 16:53:53 +0900
  LV snapshot status     source of
                         snap001 [active]
  LV Status              available
";
        let res = parse_columns(input, 2, 22);
        assert_eq!(res.len(), 1);
        let rec = &res[0];
        assert_eq!(
            rec["LV Creation host, time"],
            "lima-server, 2025-09-06 16:53:53 +0900"
        );
        assert_eq!(rec["LV snapshot status"], "source of snap001 [active]");
        assert_eq!(rec["LV Status"], "available");
    }

    #[test]
    fn test_columns_multi_record() {
        let input = "\
  --- Logical volume ---
  LV Name                vol001
  LV Size                10.00 GiB

  --- Logical volume ---
  LV Name                snap001
  LV Size                1.00 GiB
";
        let res = parse_columns(input, 2, 22);
        assert_eq!(res.len(), 2);
        assert_eq!(res[0]["LV Name"], "vol001");
        assert_eq!(res[1]["LV Name"], "snap001");
        assert_eq!(res[1]["LV Size"], "1.00 GiB");
    }

    const SYS_SHOW: &str = "\
System:
    State: ready
    debug: off
LLDs:
    iscsi: ready
Backing stores:
    null
    rdwr (bsoflags sync:direct)
iSNS:
    iSNS=Off
    iSNSServerPort=3205
";

    #[test]
    fn test_tree_sys_show() {
        let res = parse_tree(SYS_SHOW);
        assert_eq!(
            res.get("System").unwrap().get("State").unwrap().as_str(),
            Some("ready")
        );
        assert_eq!(
            res.get("LLDs").unwrap().get("iscsi").unwrap().as_str(),
            Some("ready")
        );
        let stores = res.get("Backing stores").unwrap();
        assert_eq!(stores.get("null"), Some(&Tree::Leaf(None)));
        assert_eq!(
            stores.get("rdwr").unwrap().as_str(),
            Some("bsoflags sync:direct")
        );
        assert_eq!(
            res.get("iSNS").unwrap().get("iSNSServerPort").unwrap().as_str(),
            Some("3205")
        );
    }

    const TARGET_SHOW: &str = "\
Target 1: iqn.def
    System information:
        Driver: iscsi
        State: ready
    I_T nexus information:
        I_T nexus: 3
            Initiator: iqn.1996-04.org.alpinelinux:01:c1f2520715f alias: test1
            Connection: 0
                IP Address: 192.168.64.41
            Connection: 1
                IP Address: 192.168.64.42
    LUN information:
        LUN: 0
            Type: controller
            Backing store type: null
            Backing store path: None
        LUN: 1
            Type: disk
            Backing store type: rdwr
            Backing store path: /dev/vg0/vol01
        LUN: 2
            Type: disk
            Backing store type: rdwr
            Backing store path: /dev/vg0/vol02
    Account information:
        user1
    ACL information:
        192.168.64.0/24
";

    #[test]
    fn test_tree_target_with_nexus_and_two_luns() {
        let res = parse_tree(TARGET_SHOW);
        let target = res.get("Target 1").unwrap();
        assert_eq!(target.get("name").unwrap().as_str(), Some("iqn.def"));

        let nexus = target
            .get("I_T nexus information")
            .unwrap()
            .get("I_T nexus 3")
            .unwrap();
        assert_eq!(
            nexus.get("Connection 0").unwrap().get("IP Address").unwrap().as_str(),
            Some("192.168.64.41")
        );
        assert_eq!(
            nexus.get("Connection 1").unwrap().get("IP Address").unwrap().as_str(),
            Some("192.168.64.42")
        );

        let luns = target.get("LUN information").unwrap().as_node().unwrap();
        assert_eq!(luns.len(), 3);
        let lun1 = luns.get("LUN 1").unwrap();
        assert_eq!(lun1.get("name").unwrap().as_str(), Some("1"));
        assert_eq!(
            lun1.get("Backing store path").unwrap().as_str(),
            Some("/dev/vg0/vol01")
        );
        let lun2 = luns.get("LUN 2").unwrap();
        assert_eq!(
            lun2.get("Backing store path").unwrap().as_str(),
            Some("/dev/vg0/vol02")
        );

        let accounts = target.get("Account information").unwrap().as_node().unwrap();
        assert_eq!(accounts.keys().collect::<Vec<_>>(), vec!["user1"]);
        let acls = target.get("ACL information").unwrap().as_node().unwrap();
        assert_eq!(acls.keys().collect::<Vec<_>>(), vec!["192.168.64.0/24"]);
    }

    #[test]
    fn test_tree_empty_section_is_leaf() {
        let input = "\
Target 1: iqn.abc
    I_T nexus information:
    Account information:
";
        let res = parse_tree(input);
        let target = res.get("Target 1").unwrap();
        assert_eq!(
            target.get("I_T nexus information"),
            Some(&Tree::Leaf(None))
        );
    }

    #[test]
    fn test_tree_promoted_leaf_keeps_collecting_children() {
        let input = "\
rdwr (bsoflags sync:direct)
    alias: a
    mode: b
";
        let res = parse_tree(input);
        let node = res.get("rdwr").unwrap();
        assert_eq!(node.get("name").unwrap().as_str(), Some("bsoflags sync:direct"));
        assert_eq!(node.get("alias").unwrap().as_str(), Some("a"));
        assert_eq!(node.get("mode").unwrap().as_str(), Some("b"));
    }

    #[test]
    fn test_report_flattens_kind_arrays() {
        let input = r#"{"report":[{"lv":[{"lv_name":"a"},{"lv_name":"b"}]},{"lv":[{"lv_name":"c"}]}]}"#;
        let res = parse_report(input, "lv").unwrap();
        assert_eq!(res.len(), 3);
        assert_eq!(res[2]["lv_name"], "c");
    }

    #[test]
    fn test_report_ignores_other_kinds() {
        let input = r#"{"report":[{"vg":[{"vg_name":"vg0"}]}]}"#;
        let res = parse_report(input, "lv").unwrap();
        assert!(res.is_empty());
    }
}

//! lvexport integration tests
//!
//! Exercises the public surface end to end:
//! - admin output decoding (fixed-column, tree, JSON report)
//! - the error taxonomy and its HTTP/gRPC mappings
//! - configuration defaults and command-line joining

use std::time::Duration;

// =============================================================================
// Report decoding
// =============================================================================

mod report_tests {
    use lvexport::report::{parse_columns, parse_report, parse_tree, Tree};

    const LVDISPLAY: &str = "\
  --- Logical volume ---
  LV Path                /dev/vg0/vol001
  LV Name                vol001
  VG Name                vg0
  LV Creation host, time lima-server, 2025-09-06 16:53:53 +0900
  LV snapshot status     source of
                         snap001 [active]
  LV Status              available
  LV Size                10.00 GiB

  --- Logical volume ---
  LV Path                /dev/vg0/snap001
  LV Name                snap001
  VG Name                vg0
  LV Size                1.00 GiB
";

    #[test]
    fn test_lvdisplay_records() {
        let res = parse_columns(LVDISPLAY, 2, 22);
        assert_eq!(res.len(), 2);
        assert_eq!(res[0]["LV Name"], "vol001");
        assert_eq!(
            res[0]["LV Creation host, time"],
            "lima-server, 2025-09-06 16:53:53 +0900"
        );
        assert_eq!(res[0]["LV snapshot status"], "source of snap001 [active]");
        assert_eq!(res[1]["LV Name"], "snap001");
    }

    const TARGET_DUMP: &str = "\
Target 1: iqn.def
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
        LUN: 1
            Type: disk
            Backing store path: /dev/vg0/vol001
";

    #[test]
    fn test_tree_connections_addressable_by_id() {
        let tree = parse_tree(TARGET_DUMP);
        let nexus = tree
            .get("Target 1")
            .and_then(|t| t.get("I_T nexus information"))
            .and_then(|t| t.get("I_T nexus 3"))
            .unwrap();
        assert_eq!(
            nexus
                .get("Connection 0")
                .and_then(|c| c.get("IP Address"))
                .and_then(Tree::as_str),
            Some("192.168.64.41")
        );
        assert_eq!(
            nexus
                .get("Connection 1")
                .and_then(|c| c.get("IP Address"))
                .and_then(Tree::as_str),
            Some("192.168.64.42")
        );
    }

    #[test]
    fn test_tree_target_name_survives_nesting() {
        let tree = parse_tree(TARGET_DUMP);
        assert_eq!(
            tree.get("Target 1")
                .and_then(|t| t.get("name"))
                .and_then(Tree::as_str),
            Some("iqn.def")
        );
    }

    #[test]
    fn test_json_report_flatten() {
        let input =
            r#"{"report":[{"lv":[{"lv_name":"a"}]},{"lv":[{"lv_name":"b"}]}]}"#;
        let res = parse_report(input, "lv").unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0]["lv_name"], "a");
        assert_eq!(res[1]["lv_name"], "b");
    }

    #[test]
    fn test_json_report_rejects_garbage() {
        assert!(parse_report("not json", "lv").is_err());
    }
}

// =============================================================================
// Error taxonomy
// =============================================================================

mod error_tests {
    use lvexport::error::grpc_code_for_http;
    use lvexport::Error;
    use tonic::Code;

    #[test]
    fn test_grpc_mapping() {
        let status: tonic::Status = Error::NotFound("x".to_string()).into();
        assert_eq!(status.code(), Code::NotFound);

        let status: tonic::Status = Error::AlreadyInUse("x".to_string()).into();
        assert_eq!(status.code(), Code::AlreadyExists);

        let status: tonic::Status = Error::TimedOut("x".to_string()).into();
        assert_eq!(status.code(), Code::DeadlineExceeded);

        let status: tonic::Status = Error::Aborted("x".to_string()).into();
        assert_eq!(status.code(), Code::Aborted);

        let status: tonic::Status = Error::CommandFailed {
            command: "lvs".to_string(),
            code: 5,
            stderr: "boom".to_string(),
        }
        .into();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(Error::InvalidArgument("x".to_string()).http_status(), 400);
        assert_eq!(Error::NotFound("x".to_string()).http_status(), 404);
        assert_eq!(Error::AlreadyExists("x".to_string()).http_status(), 409);
        assert_eq!(Error::AlreadyInUse("x".to_string()).http_status(), 409);
        assert_eq!(Error::NotImplemented("x".to_string()).http_status(), 501);
        assert_eq!(Error::TimedOut("x".to_string()).http_status(), 500);
    }

    #[test]
    fn test_upstream_http_translation() {
        assert_eq!(grpc_code_for_http(400), Code::InvalidArgument);
        assert_eq!(grpc_code_for_http(401), Code::Unauthenticated);
        assert_eq!(grpc_code_for_http(403), Code::PermissionDenied);
        assert_eq!(grpc_code_for_http(404), Code::NotFound);
        assert_eq!(grpc_code_for_http(408), Code::DeadlineExceeded);
        assert_eq!(grpc_code_for_http(409), Code::AlreadyExists);
        assert_eq!(grpc_code_for_http(429), Code::ResourceExhausted);
        assert_eq!(grpc_code_for_http(499), Code::Cancelled);
        assert_eq!(grpc_code_for_http(500), Code::Internal);
        assert_eq!(grpc_code_for_http(501), Code::Unimplemented);
        assert_eq!(grpc_code_for_http(503), Code::Unavailable);
        assert_eq!(grpc_code_for_http(504), Code::DeadlineExceeded);
        assert_eq!(grpc_code_for_http(418), Code::Unknown);
    }
}

// =============================================================================
// Configuration and command plumbing
// =============================================================================

mod config_tests {
    use super::*;
    use lvexport::command::shell_join;
    use lvexport::Config;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.vg, "vg0");
        assert_eq!(config.become_method, "sudo");
        assert_eq!(config.tgtadm_bin, "tgtadm");
        assert_eq!(config.tgt_bstype, "rdwr");
        assert_eq!(config.default_fs, "ext4");
        assert_eq!(config.cmd_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_shell_join_quoting() {
        let argv = vec![
            "tgtadm".to_string(),
            "--targetname".to_string(),
            "iqn.x:y z".to_string(),
        ];
        assert_eq!(shell_join(&argv), "tgtadm --targetname 'iqn.x:y z'");
    }
}

// =============================================================================
// Node-side helpers
// =============================================================================

mod initiator_tests {
    use lvexport::initiator::truncate_label;

    #[test]
    fn test_label_truncation_per_filesystem() {
        let name = "persistent-volume-claim-0000";
        assert_eq!(truncate_label("ext4", name).len(), 16);
        assert_eq!(truncate_label("xfs", name).len(), 12);
        assert_eq!(truncate_label("vfat", name).len(), 11);
        assert_eq!(truncate_label("btrfs", name), name);
    }
}

//! CSI Node service: attaches exports on the consuming host.
//!
//! Staging logs in to the iSCSI target named in the publish context;
//! publishing mounts the filesystem by its label, so the node never needs
//! to know which SCSI device the login produced.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use super::v1::node_server::Node;
use super::v1::{
    node_service_capability, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeServiceCapability, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse,
};
use super::{require, require_mount_capability};
use crate::error::Error;
use crate::export::Tgtd;
use crate::initiator::{truncate_label, Initiator};
use crate::volume::Lvm;

pub struct NodeService {
    lvm: Arc<Lvm>,
    tgtd: Arc<Tgtd>,
    initiator: Arc<Initiator>,
    node_id: String,
    default_fs: String,
}

impl NodeService {
    pub fn new(
        lvm: Arc<Lvm>,
        tgtd: Arc<Tgtd>,
        initiator: Arc<Initiator>,
        node_id: &str,
        default_fs: &str,
    ) -> Self {
        Self {
            lvm,
            tgtd,
            initiator,
            node_id: node_id.to_string(),
            default_fs: default_fs.to_string(),
        }
    }

    /// Target name of the export backing a volume, if one exists.
    async fn export_target(&self, volume_id: &str) -> Result<Option<String>, Error> {
        let path = match self.lvm.vol_to_path(volume_id).await {
            Ok(path) => path,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(self
            .tgtd
            .get_export_by_path(&path)
            .await?
            .map(|t| t.targetname))
    }
}

fn context_value<'a>(
    ctx: &'a std::collections::HashMap<String, String>,
    key: &str,
) -> Result<&'a str, Error> {
    ctx.get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::InvalidArgument(format!("publish context missing {key}")))
}

#[tonic::async_trait]
impl Node for NodeService {
    /// Discover, store CHAP credentials, and log in.
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        require_mount_capability(req.volume_capability.as_ref())?;

        let targetname = context_value(&req.publish_context, "targetname")?;
        let user = context_value(&req.publish_context, "user")?;
        let passwd = context_value(&req.publish_context, "passwd")?;
        let addresses: Vec<String> =
            serde_json::from_str(context_value(&req.publish_context, "addresses")?)
                .map_err(|e| Error::InvalidArgument(format!("bad addresses: {e}")))?;
        let portal = addresses.first().ok_or_else(|| {
            Error::InvalidArgument("no portal address in publish context".to_string())
        })?;

        self.initiator.discover(portal).await?;
        self.initiator.configure_chap(targetname, user, passwd).await?;
        self.initiator.login(targetname).await?;
        info!(volume = %req.volume_id, targetname, "volume staged");
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    /// Log out of the volume's target and purge its discovery record.
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        let Some(targetname) = self.export_target(&req.volume_id).await? else {
            warn!(volume = %req.volume_id, "no export found, nothing to unstage");
            return Ok(Response::new(NodeUnstageVolumeResponse {}));
        };
        if let Some(portal) = self.initiator.logout(&targetname).await? {
            self.initiator.discovery_delete(&portal).await?;
        }
        info!(volume = %req.volume_id, targetname, "volume unstaged");
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    /// Mount the filesystem by label at the target path.
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        require(&req.target_path, "target path")?;
        let mount = require_mount_capability(req.volume_capability.as_ref())?;
        let fs = if mount.fs_type.is_empty() {
            self.default_fs.as_str()
        } else {
            mount.fs_type.as_str()
        };
        std::fs::create_dir_all(&req.target_path).map_err(Error::from)?;
        let label = truncate_label(fs, &req.volume_id);
        self.initiator.mount_by_label(&label, &req.target_path).await?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    /// Unmount and remove the mountpoint; not mounted is an error.
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        require(&req.target_path, "target path")?;
        if !self.initiator.is_mounted(&req.target_path) {
            return Err(
                Error::NotFound(format!("not mounted: {}", req.target_path)).into(),
            );
        }
        self.initiator.umount(&req.target_path).await?;
        std::fs::remove_dir(&req.target_path).map_err(Error::from)?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    /// Rescan the session and grow the filesystem online.
    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        let label = truncate_label(&self.default_fs, &req.volume_id);
        let device = self.initiator.device_by_label(&label).await?;
        if let Some(targetname) = self.export_target(&req.volume_id).await? {
            self.initiator.rescan(&targetname).await?;
        }
        self.initiator.grow_filesystem(&device).await?;
        let capacity = self
            .lvm
            .read(&req.volume_id)
            .await?
            .map(|v| v.size as i64)
            .unwrap_or_default();
        Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes: capacity,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        use node_service_capability::rpc::Type;
        let capabilities = [Type::StageUnstageVolume, Type::ExpandVolume]
            .into_iter()
            .map(|t| NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(
                    node_service_capability::Rpc { r#type: t as i32 },
                )),
            })
            .collect();
        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::command::mock::ScriptedRunner;
    use crate::config::Config;
    use crate::csi::v1::{volume_capability, VolumeCapability};

    fn service(runner: Arc<ScriptedRunner>) -> NodeService {
        let config = Config {
            node_id: "node1".to_string(),
            ..Config::default()
        };
        NodeService::new(
            Arc::new(Lvm::new(&config, runner.clone())),
            Arc::new(Tgtd::new(&config, runner.clone())),
            Arc::new(Initiator::new(runner)),
            &config.node_id,
            &config.default_fs,
        )
    }

    fn mount_cap() -> VolumeCapability {
        VolumeCapability {
            access_type: Some(volume_capability::AccessType::Mount(
                volume_capability::MountVolume::default(),
            )),
            access_mode: None,
        }
    }

    fn stage_context() -> HashMap<String, String> {
        HashMap::from([
            ("targetname".to_string(), "iqn.x:y".to_string()),
            ("user".to_string(), "u1".to_string()),
            ("passwd".to_string(), "p1".to_string()),
            (
                "addresses".to_string(),
                r#"["192.168.64.5:3260"]"#.to_string(),
            ),
        ])
    }

    #[tokio::test]
    async fn test_stage_runs_discovery_chap_login() {
        let runner = Arc::new(ScriptedRunner::new());
        for _ in 0..5 {
            runner.push_ok("");
        }
        let svc = service(runner.clone());
        svc.node_stage_volume(Request::new(NodeStageVolumeRequest {
            volume_id: "vol1".to_string(),
            staging_target_path: "/var/lib/stage/vol1".to_string(),
            volume_capability: Some(mount_cap()),
            publish_context: stage_context(),
            ..Default::default()
        }))
        .await
        .unwrap();
        // discovery, three chap updates, login
        assert_eq!(runner.call_count(), 5);
        let discovery = runner.call(0);
        assert!(discovery.windows(2).any(|w| w == ["-p", "192.168.64.5:3260"]));
        let login = runner.call(4);
        assert_eq!(login.last().map(String::as_str), Some("-l"));
    }

    #[tokio::test]
    async fn test_stage_rejects_missing_context() {
        let svc = service(Arc::new(ScriptedRunner::new()));
        let status = svc
            .node_stage_volume(Request::new(NodeStageVolumeRequest {
                volume_id: "vol1".to_string(),
                staging_target_path: "/stage".to_string(),
                volume_capability: Some(mount_cap()),
                publish_context: HashMap::new(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unstage_without_export_is_success() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok(r#"{"report":[{"lv":[]}]}"#);
        let svc = service(runner.clone());
        svc.node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "vol1".to_string(),
            staging_target_path: String::new(),
        }))
        .await
        .unwrap();
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unpublish_not_mounted_is_not_found() {
        let svc = service(Arc::new(ScriptedRunner::new()));
        let status = svc
            .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
                volume_id: "vol1".to_string(),
                target_path: "/definitely/not/mounted".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_node_get_info() {
        let svc = service(Arc::new(ScriptedRunner::new()));
        let resp = svc
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.node_id, "node1");
    }

    #[tokio::test]
    async fn test_node_capabilities() {
        let svc = service(Arc::new(ScriptedRunner::new()));
        let resp = svc
            .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.capabilities.len(), 2);
    }
}

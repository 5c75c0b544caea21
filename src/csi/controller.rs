//! CSI Controller service: volume provisioning and export management.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use super::v1::controller_server::Controller;
use super::v1::{
    controller_service_capability, list_volumes_response, validate_volume_capabilities_response,
    volume_capability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateVolumeRequest,
    CreateVolumeResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListVolumesRequest, ListVolumesResponse,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
    VolumeCondition,
};
use super::{require, require_mount_capability};
use crate::error::Error;
use crate::export::Tgtd;
use crate::initiator::truncate_label;
use crate::volume::Lvm;

const TOKEN_PREFIX: &str = "vol-";

/// Access mode every published volume supports.
const SUPPORTED_MODES: [volume_capability::access_mode::Mode; 1] =
    [volume_capability::access_mode::Mode::SingleNodeWriter];

pub struct ControllerService {
    lvm: Arc<Lvm>,
    tgtd: Arc<Tgtd>,
    default_fs: String,
}

impl ControllerService {
    pub fn new(lvm: Arc<Lvm>, tgtd: Arc<Tgtd>, default_fs: &str) -> Self {
        Self {
            lvm,
            tgtd,
            default_fs: default_fs.to_string(),
        }
    }

    fn capability(t: controller_service_capability::rpc::Type) -> ControllerServiceCapability {
        ControllerServiceCapability {
            r#type: Some(controller_service_capability::Type::Rpc(
                controller_service_capability::Rpc { r#type: t as i32 },
            )),
        }
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    /// Idempotent create: an existing volume of a compatible size is
    /// returned as-is; a fresh volume is also formatted with the default
    /// filesystem so nodes can mount it by label.
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.name, "volume name")?;
        let range = req.capacity_range.unwrap_or_default();
        if range.required_bytes <= 0 {
            return Err(Error::InvalidArgument("no capacity specified".to_string()).into());
        }

        if let Some(vol) = self.lvm.read(&req.name).await? {
            if (vol.size as i64) < range.required_bytes {
                return Err(Error::AlreadyExists(format!(
                    "volume exists but is smaller than requested: {}",
                    req.name
                ))
                .into());
            }
            if range.limit_bytes > 0 && range.limit_bytes < vol.size as i64 {
                return Err(Error::AlreadyExists(format!(
                    "volume exists but exceeds the requested limit: {}",
                    req.name
                ))
                .into());
            }
            debug!(name = %req.name, size = vol.size, "volume already provisioned");
            return Ok(Response::new(CreateVolumeResponse {
                volume: Some(Volume {
                    capacity_bytes: vol.size as i64,
                    volume_id: vol.name,
                    volume_context: Default::default(),
                }),
            }));
        }

        let vol = self.lvm.create(&req.name, range.required_bytes as u64).await?;
        let label = truncate_label(&self.default_fs, &req.name);
        self.lvm
            .format(&req.name, &self.default_fs, Some(&label))
            .await?;
        info!(name = %req.name, size = vol.size, fs = %self.default_fs, "volume created");
        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: vol.size as i64,
                volume_id: vol.name,
                volume_context: Default::default(),
            }),
        }))
    }

    /// Idempotent delete: not-found is success.
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        self.lvm.delete(&req.volume_id).await?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    /// Export the volume and hand the attach parameters back as the
    /// publish context. List-valued entries are JSON-encoded.
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        require(&req.node_id, "node id")?;
        require_mount_capability(req.volume_capability.as_ref())?;

        let path = self.lvm.vol_to_path(&req.volume_id).await?;
        let acl = vec!["ALL".to_string()];
        let info = self.tgtd.export_volume(&path, &acl, req.readonly).await?;

        let mut ctx = HashMap::new();
        ctx.insert("protocol".to_string(), info.protocol);
        ctx.insert(
            "addresses".to_string(),
            serde_json::to_string(&info.addresses)
                .map_err(|e| Error::Internal(e.to_string()))?,
        );
        ctx.insert("targetname".to_string(), info.targetname);
        ctx.insert("tid".to_string(), info.tid.to_string());
        ctx.insert("user".to_string(), info.user);
        ctx.insert("passwd".to_string(), info.passwd);
        ctx.insert("lun".to_string(), info.lun.to_string());
        ctx.insert(
            "acl".to_string(),
            serde_json::to_string(&info.acl).map_err(|e| Error::Internal(e.to_string()))?,
        );
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: ctx,
        }))
    }

    /// Remove every export backed by the volume; zero matches is success.
    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        let path = match self.lvm.vol_to_path(&req.volume_id).await {
            Ok(path) => path,
            Err(Error::NotFound(_)) => {
                info!(volume = %req.volume_id, "volume gone, nothing to unpublish");
                return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
            }
            Err(e) => return Err(e.into()),
        };
        for tgt in self.tgtd.export_list().await? {
            if tgt.volumes.iter().any(|v| v == &path) {
                self.tgtd.unexport_volume(&tgt.targetname, false).await?;
            }
        }
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    /// Echo back the subset of requested capabilities this plugin supports.
    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument("no capabilities".to_string()).into());
        }
        if self.lvm.read(&req.volume_id).await?.is_none() {
            return Err(
                Error::NotFound(format!("volume not found: {}", req.volume_id)).into(),
            );
        }
        let confirmed: Vec<_> = req
            .volume_capabilities
            .into_iter()
            .filter(|cap| {
                cap.access_mode
                    .as_ref()
                    .map(|m| SUPPORTED_MODES.iter().any(|s| *s as i32 == m.mode))
                    .unwrap_or(false)
            })
            .collect();
        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(validate_volume_capabilities_response::Confirmed {
                volume_context: Default::default(),
                volume_capabilities: confirmed,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    /// Cursor pagination over all volumes; the token names the first entry
    /// of the next page.
    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let req = request.into_inner();
        let resume = if req.starting_token.is_empty() {
            None
        } else {
            let name = req.starting_token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
                Error::Aborted(format!("invalid starting token: {}", req.starting_token))
            })?;
            Some(name.to_string())
        };

        let vols = self.lvm.list().await?;
        let max = req.max_entries.max(0) as usize;
        let mut skipping = resume.is_some();
        let mut entries = Vec::new();
        let mut next_token = String::new();
        for vol in vols {
            // the token names the first entry of the next page, so the
            // matching volume itself is returned, not skipped
            if skipping {
                if Some(&vol.name) != resume.as_ref() {
                    continue;
                }
                skipping = false;
            }
            if max > 0 && entries.len() >= max {
                next_token = format!("{TOKEN_PREFIX}{}", vol.name);
                break;
            }
            entries.push(list_volumes_response::Entry {
                volume: Some(Volume {
                    capacity_bytes: vol.size as i64,
                    volume_id: vol.name,
                    volume_context: Default::default(),
                }),
                status: Some(list_volumes_response::VolumeStatus {
                    published_node_ids: Vec::new(),
                    volume_condition: Some(VolumeCondition {
                        abnormal: false,
                        message: String::new(),
                    }),
                }),
            });
        }
        Ok(Response::new(ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        let stats = self.lvm.pool_stats().await?;
        Ok(Response::new(GetCapacityResponse {
            available_capacity: stats.free as i64,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        use controller_service_capability::rpc::Type;
        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::ExpandVolume,
            Type::GetCapacity,
            Type::GetVolume,
            Type::PublishReadonly,
        ]
        .into_iter()
        .map(Self::capability)
        .collect();
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Grow the volume and rebind any live LUN so the target daemon sees
    /// the new size; the filesystem itself grows on the node.
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        let range = req.capacity_range.unwrap_or_default();
        if range.required_bytes <= 0 {
            return Err(Error::InvalidArgument("no capacity specified".to_string()).into());
        }
        self.lvm
            .resize(&req.volume_id, range.required_bytes as u64)
            .await?;
        let path = self.lvm.vol_to_path(&req.volume_id).await?;
        match self.tgtd.refresh_volume_by_path(&path).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                debug!(volume = %req.volume_id, "not exported, nothing to refresh");
            }
            Err(e) => return Err(e.into()),
        }
        let vol = self.lvm.read(&req.volume_id).await?.ok_or_else(|| {
            Error::NotFound(format!("volume not found: {}", req.volume_id))
        })?;
        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: vol.size as i64,
            node_expansion_required: true,
        }))
    }

    /// Volume details plus the addresses currently attached to its export.
    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        require(&req.volume_id, "volume id")?;
        let vol = self.lvm.read(&req.volume_id).await?.ok_or_else(|| {
            Error::NotFound(format!("volume not found: {}", req.volume_id))
        })?;
        let path = self.lvm.vol_to_path(&req.volume_id).await?;
        let mut nodes = Vec::new();
        for tgt in self.tgtd.export_list().await? {
            if tgt.volumes.iter().any(|v| v == &path) {
                for client in &tgt.connected {
                    nodes.extend(client.addresses.iter().cloned());
                }
            }
        }
        Ok(Response::new(ControllerGetVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: vol.size as i64,
                volume_id: vol.name,
                volume_context: Default::default(),
            }),
            status: Some(super::v1::controller_get_volume_response::VolumeStatus {
                published_node_ids: nodes,
                volume_condition: Some(VolumeCondition {
                    abnormal: false,
                    message: String::new(),
                }),
            }),
        }))
    }
}

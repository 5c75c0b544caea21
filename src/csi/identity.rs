//! CSI Identity service.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::warn;

use super::v1::identity_server::Identity;
use super::v1::{
    plugin_capability, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
    GetPluginInfoRequest, GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use crate::export::Tgtd;

pub const PLUGIN_NAME: &str = "lvexport";

pub struct IdentityService {
    tgtd: Arc<Tgtd>,
}

impl IdentityService {
    pub fn new(tgtd: Arc<Tgtd>) -> Self {
        Self { tgtd }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: PLUGIN_NAME.to_string(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: vec![
                PluginCapability {
                    r#type: Some(plugin_capability::Type::Service(
                        plugin_capability::Service {
                            r#type: plugin_capability::service::Type::ControllerService as i32,
                        },
                    )),
                },
                PluginCapability {
                    r#type: Some(plugin_capability::Type::VolumeExpansion(
                        plugin_capability::VolumeExpansion {
                            r#type: plugin_capability::volume_expansion::Type::Online as i32,
                        },
                    )),
                },
            ],
        }))
    }

    /// Health of the export daemon, reported as readiness. Never errors:
    /// a failing check is "not ready".
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        let ready = match self.tgtd.system_ready().await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "health check failed");
                false
            }
        };
        Ok(Response::new(ProbeResponse { ready: Some(ready) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::ScriptedRunner;
    use crate::config::Config;
    use crate::error::Error;

    fn service(runner: Arc<ScriptedRunner>) -> IdentityService {
        IdentityService::new(Arc::new(Tgtd::new(&Config::default(), runner)))
    }

    #[tokio::test]
    async fn test_plugin_info_carries_version() {
        let svc = service(Arc::new(ScriptedRunner::new()));
        let resp = svc
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.name, "lvexport");
        assert!(!resp.vendor_version.is_empty());
    }

    #[tokio::test]
    async fn test_probe_not_ready_on_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_err(Error::TimedOut("tgtadm".to_string()));
        let svc = service(runner);
        let resp = svc
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.ready, Some(false));
    }

    #[tokio::test]
    async fn test_probe_ready() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("System:\n    State: ready\n");
        let svc = service(runner);
        let resp = svc
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.ready, Some(true));
    }
}

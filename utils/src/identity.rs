use csi_s3_proto::csi::identity_server::Identity;
use csi_s3_proto::csi::plugin_capability::service::Type as ServiceType;
use csi_s3_proto::csi::plugin_capability::{Service, Type as CapabilityType};
use csi_s3_proto::csi::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use tonic::{Request, Response, Status};

/// Shared `Identity` service implementation: every process that serves a CSI endpoint (the
/// controller and the node plugin alike) advertises the same plugin name/version and answers
/// liveness probes the same way, so there is exactly one implementation of it in the workspace.
pub struct IdentityService {
    name: String,
    version: String,
    is_controller: bool,
}

impl IdentityService {
    pub fn new(name: impl Into<String>, version: impl Into<String>, is_controller: bool) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            is_controller,
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let capabilities = if self.is_controller {
            vec![PluginCapability {
                r#type: Some(CapabilityType::Service(Service {
                    r#type: ServiceType::ControllerService as i32,
                })),
            }]
        } else {
            Vec::new()
        };
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: true }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn reports_the_configured_name_and_version() {
        let svc = IdentityService::new("s3.csi.aws.com", "1.2.3", true);
        let resp = svc.get_plugin_info(Request::new(GetPluginInfoRequest {})).await.unwrap();
        assert_eq!(resp.get_ref().name, "s3.csi.aws.com");
        assert_eq!(resp.get_ref().vendor_version, "1.2.3");
    }

    #[tokio::test]
    async fn only_the_controller_advertises_the_controller_service_capability() {
        let controller = IdentityService::new("n", "v", true);
        let node = IdentityService::new("n", "v", false);
        let controller_caps = controller
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap();
        let node_caps = node
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap();
        assert_eq!(controller_caps.get_ref().capabilities.len(), 1);
        assert!(node_caps.get_ref().capabilities.is_empty());
    }
}

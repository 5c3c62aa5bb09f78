use csi_s3_proto::csi::node_server::Node;
use csi_s3_proto::csi::node_service_capability::rpc::Type as NodeRpcType;
use csi_s3_proto::csi::node_service_capability::Rpc;
use csi_s3_proto::csi::{
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeServiceCapability, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, VolumeCondition,
};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tonic::{Request, Response, Status};

use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::publish::{self, PublishContext};
use crate::unpublish;

pub struct NodeService {
    pub config: Config,
    pub client: kube::Client,
    pub attachments: Api<csi_s3_types::MountpointAttachment>,
    pub mounter_pods: Api<Pod>,
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let resolver = CredentialResolver::new(&self.config, self.client.clone());
        let ctx = PublishContext {
            attachments: &self.attachments,
            mounter_pods: &self.mounter_pods,
            credentials: &resolver,
            plugin_root_dir: &self.config.plugin_root_dir,
            publish_timeout: self.config.publish_timeout,
        };
        publish::publish(&ctx, &req).await?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        unpublish::unpublish(&req).await?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: 0,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(csi_s3_proto::csi::node_service_capability::Type::Rpc(Rpc {
                    r#type: NodeRpcType::GetVolumeStats as i32,
                })),
            }],
        }))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Ok(Response::new(NodeGetVolumeStatsResponse {
            volume_condition: Some(VolumeCondition {
                abnormal: false,
                message: String::new(),
            }),
        }))
    }
}

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::storage::v1::CSINode;
use kube::{Api, Client};
use tracing::debug;

/// Verifies the CSI node service is advertised on `node_name` before any mounter pod is created
/// there (§4.5 step 3). Reads the orchestrator's `CSINode` object first; if that kind is
/// unavailable in this cluster, falls back to a configmap the node plugin maintains itself.
pub struct NodeRegistrationChecker {
    csi_nodes: Api<CSINode>,
    fallback_configmaps: Api<ConfigMap>,
    driver_name: String,
    fallback_namespace: String,
}

impl NodeRegistrationChecker {
    pub fn new(client: Client, driver_name: String, fallback_namespace: String) -> Self {
        Self {
            csi_nodes: Api::all(client.clone()),
            fallback_configmaps: Api::namespaced(client, &fallback_namespace),
            driver_name,
            fallback_namespace,
        }
    }

    /// `Ok(true)` iff the driver is advertised as ready on `node_name`.
    pub async fn is_csi_node_advertised(&self, node_name: &str) -> kube::Result<bool> {
        match self.csi_nodes.get(node_name).await {
            Ok(csi_node) => {
                let advertised = csi_node
                    .spec
                    .drivers
                    .iter()
                    .any(|d| d.name == self.driver_name);
                if advertised {
                    return Ok(true);
                }
                debug!(node_name, "CSINode present but driver not yet registered, checking fallback");
                self.check_fallback_configmap(node_name).await
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(node_name, "no CSINode object yet, checking fallback configmap");
                self.check_fallback_configmap(node_name).await
            }
            Err(e) => Err(e),
        }
    }

    async fn check_fallback_configmap(&self, node_name: &str) -> kube::Result<bool> {
        let name = format!("s3-csi-node-registration-{node_name}");
        match self.fallback_configmaps.get(&name).await {
            Ok(cm) => Ok(cm
                .data
                .map(|d| d.get("ready").map(|v| v == "true").unwrap_or(false))
                .unwrap_or(false)),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(node_name, namespace = %self.fallback_namespace, "no fallback configmap either");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt, Resource};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use csi_s3_controller::attachment_store::KubeAttachmentStore;
use csi_s3_controller::config::Config;
use csi_s3_controller::harness::{self, Context};
use csi_s3_controller::health;
use csi_s3_controller::janitor::{self, Janitor};
use csi_s3_controller::leader::LeaderElector;
use csi_s3_controller::object_store::S3ObjectStore;
use csi_s3_controller::pod_builder::PodBuilderConfig;
use csi_s3_controller::preconditions::NodeRegistrationChecker;
use csi_s3_controller::provisioning::ProvisioningService;
use csi_s3_controller::reconcile::{PodReconciler, PodReconcilerConfig};
use csi_s3_controller::volume_registry::ConfigMapVolumeRegistry;
use csi_s3_proto::csi::controller_server::ControllerServer;
use csi_s3_proto::csi::identity_server::IdentityServer;
use csi_s3_types::MountpointAttachment;
use csi_s3_utils::identity::IdentityService;
use csi_s3_utils::migration::compare_versions;

const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(20);
const DRIVER_NAME: &str = "s3.csi.aws.com";
const VOLUME_REGISTRY_CONFIGMAP: &str = "s3-csi-volume-registry";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let client = Client::try_default().await?;
    prepare_crd(&client).await?;

    let attachments = Arc::new(KubeAttachmentStore::new(Api::all(client.clone())));
    let mounter_pods: Api<Pod> = Api::namespaced(client.clone(), &config.mounter_namespace);
    let pvs: Api<k8s_openapi::api::core::v1::PersistentVolume> = Api::all(client.clone());

    let leases: Api<Lease> = Api::namespaced(client.clone(), &config.mounter_namespace);
    let elector = LeaderElector::new(leases, config.lease_name.clone(), config.identity.clone());
    let is_leader = elector.handle();
    let _leader_handle = tokio::spawn(elector.run());

    let _health_handle = tokio::spawn(health::serve(config.health_listen_addr.parse()?, Arc::clone(&is_leader)));

    let preconditions = NodeRegistrationChecker::new(
        client.clone(),
        DRIVER_NAME.to_owned(),
        config.mounter_namespace.clone(),
    );
    let reconciler = PodReconciler::new(
        attachments.clone(),
        client.clone(),
        mounter_pods.clone(),
        pvs,
        preconditions,
        PodReconcilerConfig {
            driver_name: DRIVER_NAME.to_owned(),
            driver_version: config.csi_driver_version.clone(),
            mounter_namespace: config.mounter_namespace.clone(),
            pod_builder: PodBuilderConfig {
                namespace: config.mounter_namespace.clone(),
                image: config.mounter_image.clone(),
                priority_class: config.mounter_priority_class.clone(),
                driver_version: config.csi_driver_version.clone(),
                plugin_root_dir: config.plugin_root_dir.clone(),
                cache_memory_multiplier: config.cache_memory_multiplier,
                cache_size_bytes: None,
            },
        },
        Arc::clone(&is_leader),
    );

    let janitor = Janitor::new(attachments.clone(), mounter_pods.clone(), config.stale_threshold);
    let janitor_leader = Arc::clone(&is_leader);
    let _janitor_handle = tokio::spawn(janitor::run(janitor, config.cleanup_interval, move || {
        janitor_leader.load(std::sync::atomic::Ordering::Relaxed)
    }));

    let provisioning_handle = tokio::spawn(run_provisioning_service(
        config.clone(),
        client.clone(),
        Arc::clone(&is_leader),
    ));

    let ctx = Context::new(reconciler);
    let all_pods: Api<Pod> = Api::all(client);
    harness::run(ctx, all_pods).await;

    provisioning_handle.abort();
    Ok(())
}

async fn run_provisioning_service(
    config: Config,
    client: Client,
    is_leader: Arc<std::sync::atomic::AtomicBool>,
) -> Result<()> {
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let s3_client = aws_sdk_s3::Client::new(&aws_config);
    let objects = Arc::new(S3ObjectStore::new(s3_client));
    let configmaps: Api<ConfigMap> = Api::namespaced(client, &config.mounter_namespace);
    let volumes = Arc::new(ConfigMapVolumeRegistry::new(configmaps, VOLUME_REGISTRY_CONFIGMAP.to_owned()));
    let service = ProvisioningService::new(volumes, objects, is_leader);
    let identity = IdentityService::new(DRIVER_NAME, &config.csi_driver_version, true);

    let endpoint: tokio::net::UnixListener = bind_unix_socket(&config.endpoint_url)?;
    let incoming = tokio_stream::wrappers::UnixListenerStream::new(endpoint);
    info!(endpoint = %config.endpoint_url, "controller gRPC service listening");
    tonic::transport::Server::builder()
        .add_service(ControllerServer::new(service))
        .add_service(IdentityServer::new(identity))
        .serve_with_incoming(incoming)
        .await?;
    Ok(())
}

fn bind_unix_socket(endpoint_url: &str) -> Result<tokio::net::UnixListener> {
    let path = endpoint_url.strip_prefix("unix://").unwrap_or(endpoint_url);
    let _ = std::fs::remove_file(path);
    Ok(tokio::net::UnixListener::bind(path)?)
}

/// Ensures the `MountpointAttachment` CRD is installed and, if an older version is already
/// installed, patches it to the current one.
async fn prepare_crd(client: &Client) -> Result<()> {
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let existing: HashMap<_, _> = crd_api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter_map(|crd| crd.metadata.name.map(|name| (name, crd.spec.versions)))
        .collect();

    let definition = MountpointAttachment::crd();
    match existing.get(MountpointAttachment::crd_name()) {
        None => {
            debug!("MountpointAttachment CRD not found, creating it");
            let _crd = crd_api.create(&PostParams::default(), &definition).await?;
        }
        Some(versions) => {
            let current_version = MountpointAttachment::version(&());
            let is_newer = versions
                .iter()
                .all(|v| matches!(compare_versions(&current_version, &v.name), Ok(std::cmp::Ordering::Greater)));
            if is_newer {
                debug!(%current_version, "patching MountpointAttachment CRD to current version");
                let _crd = crd_api
                    .patch(
                        MountpointAttachment::crd_name(),
                        &PatchParams::default(),
                        &Patch::Merge(definition),
                    )
                    .await?;
            }
        }
    }

    let establish = await_condition(
        crd_api,
        MountpointAttachment::crd_name(),
        conditions::is_crd_established(),
    );
    tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, establish).await??;
    debug!("MountpointAttachment CRD established");
    Ok(())
}

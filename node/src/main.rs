use anyhow::Result;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use csi_s3_node::config::Config;
use csi_s3_node::service::NodeService;
use csi_s3_proto::csi::identity_server::IdentityServer;
use csi_s3_proto::csi::node_server::NodeServer;
use csi_s3_types::MountpointAttachment;
use csi_s3_utils::identity::IdentityService;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DRIVER_NAME: &str = "s3.csi.aws.com";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let client = Client::try_default().await?;

    let attachments: Api<MountpointAttachment> = Api::all(client.clone());
    let mounter_pods: Api<Pod> = Api::namespaced(client.clone(), &config.driver_namespace);

    let _health_handle = tokio::spawn(serve_health(config.health_listen_addr.parse()?));

    let service = NodeService {
        config: config.clone(),
        client,
        attachments,
        mounter_pods,
    };
    let identity = IdentityService::new(DRIVER_NAME, env!("CARGO_PKG_VERSION"), false);

    let endpoint: tokio::net::UnixListener = bind_unix_socket(&config.endpoint_url)?;
    let incoming = tokio_stream::wrappers::UnixListenerStream::new(endpoint);
    info!(endpoint = %config.endpoint_url, node_id = %config.node_id, "node gRPC service listening");
    tonic::transport::Server::builder()
        .add_service(NodeServer::new(service))
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

async fn serve_health(listen_addr: std::net::SocketAddr) -> Result<()> {
    let router = Router::new().route("/healthz", get(|| async { "ok" }));
    axum::Server::bind(&listen_addr)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

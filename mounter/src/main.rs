use clap::Parser;
use csi_s3_mounter::agent;
use csi_s3_mounter::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let cfg = agent::AgentConfig {
        socket_path: config.socket_path.clone().into(),
        transport_accept_timeout: config.transport_accept_timeout(),
        fuse_binary: config.fuse_binary.clone(),
        source_dir: config.source_dir.clone().into(),
    };

    let exit_code = agent::run(cfg).await;
    std::process::exit(exit_code);
}

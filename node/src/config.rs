use std::time::Duration;

use clap::Parser;

/// Node plugin config. Environment variables bound here come from the same closed set named in
/// §6 as the controller's (`endpoint-url`, `plugin-root-dir`) plus node-specific additions.
#[derive(Debug, Clone, Parser)]
#[non_exhaustive]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// gRPC listen endpoint for the Node/Identity services, e.g. `unix:///csi/csi.sock`.
    #[arg(long, env = "endpoint-url")]
    pub endpoint_url: String,

    /// This node's identifier, returned from `NodeGetInfo`.
    #[arg(long, env = "node-id")]
    pub node_id: String,

    /// Root directory under which source mounts and mounter-pod state live (§3).
    #[arg(long, env = "plugin-root-dir", default_value = "/var/lib/kubelet/plugins/s3.csi.aws.com")]
    pub plugin_root_dir: String,

    /// Namespace the driver's install-time default credentials secret lives in (C7 level 2).
    #[arg(long, env = "mounter-namespace", default_value = "kube-system")]
    pub driver_namespace: String,

    /// `tera` template for the per-driver default secret's name (C7 level 2), rendered with
    /// `driver_namespace` in scope.
    #[arg(long, default_value = "{{ driver_namespace }}-s3-credentials")]
    pub default_secret_name_template: String,

    /// Profile credentials file on the host (C7 level 3), e.g. `~/.aws/credentials` equivalent.
    #[arg(long, default_value = "/etc/s3-csi/credentials")]
    pub profile_credentials_path: String,

    /// Deadline for `NodePublishVolume` (§4.6 step 5/6).
    #[arg(long, value_parser = parse_duration_secs, default_value = "90")]
    pub publish_timeout: Duration,

    /// Accept timeout the sender waits for the mounter pod's socket to appear and connect.
    #[arg(long, value_parser = parse_duration_secs, default_value = "120")]
    pub transport_accept_timeout: Duration,

    /// Address the liveness HTTP endpoint listens on (§6).
    #[arg(long, default_value = "0.0.0.0:9809")]
    pub health_listen_addr: String,
}

fn parse_duration_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse::<u64>().map(Duration::from_secs)
}

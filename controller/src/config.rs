use std::time::Duration;

use clap::Parser;

/// Controller config. Environment variables bound here are drawn from the closed set named in
/// §6: `endpoint-url`, `mounter-namespace`, `mounter-image`, `csi-driver-version`,
/// `plugin-root-dir`.
#[derive(Debug, Clone, Parser)]
#[non_exhaustive]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// gRPC listen endpoint for the Controller/Identity services (§6), e.g. `unix:///csi/csi.sock`.
    #[arg(long, env = "endpoint-url")]
    pub endpoint_url: String,

    /// Namespace mounter pods (and the driver's own install-time secret) live in.
    #[arg(long, env = "mounter-namespace", default_value = "kube-system")]
    pub mounter_namespace: String,

    /// Image used for mounter pods built by the Mounter-Pod Builder (C3).
    #[arg(long, env = "mounter-image")]
    pub mounter_image: String,

    /// This build's driver version; stamped onto every mounter pod it creates (§3, §4.5).
    #[arg(long, env = "csi-driver-version")]
    pub csi_driver_version: String,

    /// Root directory on each node under which source mounts live (§3).
    #[arg(long, env = "plugin-root-dir", default_value = "/var/lib/kubelet/plugins/s3.csi.aws.com")]
    pub plugin_root_dir: String,

    /// Priority class assigned to mounter pods (§4.3).
    #[arg(long, default_value = "system-node-critical")]
    pub mounter_priority_class: String,

    /// Memory request per byte of declared cache size, used by the Mounter-Pod Builder's
    /// resource-calculation formula (§4.3, an explicitly undocumented tunable per §9).
    #[arg(long, default_value_t = 0.1)]
    pub cache_memory_multiplier: f64,

    /// How often the stale-entry janitor (§4.5) and the background janitor (C9) run.
    #[arg(long, value_parser = parse_duration_secs, default_value = "120")]
    pub cleanup_interval: Duration,

    /// Age after which an attachment with no live workload is considered stale (§4.5).
    #[arg(long, value_parser = parse_duration_secs, default_value = "120")]
    pub stale_threshold: Duration,

    /// Address the liveness HTTP endpoint listens on (§6).
    #[arg(long, default_value = "0.0.0.0:9810")]
    pub health_listen_addr: String,

    /// Name of the coordination.k8s.io Lease used for leader election (§5).
    #[arg(long, default_value = "s3-csi-controller-leader")]
    pub lease_name: String,

    /// Identity of this replica in leader election (defaults to the pod name via the
    /// orchestrator's downward API in deployment, but any unique string works).
    #[arg(long, env = "pod-name")]
    pub identity: String,
}

fn parse_duration_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse::<u64>().map(Duration::from_secs)
}

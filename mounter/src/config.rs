use std::time::Duration;

use clap::Parser;
use csi_s3_utils::consts::{DEFAULT_TRANSPORT_ACCEPT_TIMEOUT_SECS, MOUNT_OPTIONS_SOCKET_PATH};

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path of the options socket inside this pod's filesystem (C2, §4.2).
    #[arg(long, default_value = MOUNT_OPTIONS_SOCKET_PATH)]
    pub socket_path: String,

    /// How long to wait for a sender to connect before treating this as a transport timeout.
    #[arg(long, default_value_t = DEFAULT_TRANSPORT_ACCEPT_TIMEOUT_SECS)]
    pub transport_accept_timeout: u64,

    /// FUSE binary to exec once options arrive. Treated as an opaque child process (§1).
    #[arg(long, default_value = "mount-s3")]
    pub fuse_binary: String,

    /// Directory this agent mounts the FUSE filesystem onto (bind-mounted onto workload targets
    /// by the node plugin).
    #[arg(long, default_value = "/mnt/source")]
    pub source_dir: String,
}

impl Config {
    pub fn transport_accept_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_accept_timeout)
    }
}

//! Well-known paths, names, and labels shared by every crate in the driver.

/// Root directory on the host under which the node plugin keeps its state.
pub const DEFAULT_PLUGIN_ROOT_DIR: &str = "/var/lib/kubelet/plugins/s3.csi.aws.com";

/// Subdirectory of the plugin root holding one source-mount directory per mounter pod.
pub const SOURCE_MOUNT_SUBDIR: &str = "mnt";

/// Path, inside a mounter pod's filesystem, of the options socket (C2).
pub const MOUNT_OPTIONS_SOCKET_PATH: &str = "/tmp/mount-options.sock";

/// Directory, inside a mounter pod's filesystem, the agent writes `OptionsFrame::credential_files`
/// side-files to before exec'ing FUSE (§4.2, §4.4).
pub const CREDENTIAL_FILES_DIR: &str = "/tmp/mount-credentials";

/// Key of the CA bundle entry in `OptionsFrame::credential_files`, if the resolved credential
/// bundle carried one (§4.7).
pub const CA_BUNDLE_FILENAME: &str = "ca-bundle.pem";

/// Sentinel file written by the mounter agent on exit, holding the FUSE process exit code.
pub const EXIT_CODE_FILENAME: &str = "exit-code";

/// Sentinel file written by the mounter agent on non-zero exit, holding tail of stderr.
pub const ERROR_FILENAME: &str = "error";

/// Field manager used for every server-side-apply patch the driver issues.
pub const FIELD_MANAGER: &str = "s3.csi.aws.com";

/// Label carrying the driver version that built a mounter pod.
pub const DRIVER_VERSION_LABEL: &str = "s3.csi.aws.com/driver-version";

/// Annotation set on a mounter pod that should stop accepting new workload attachments.
pub const ANNOTATION_NO_NEW_WORKLOAD: &str = "s3.csi.aws.com/no-new-workload";

/// Annotation set on a mounter pod that is draining and should be deleted once empty.
pub const ANNOTATION_NEEDS_UNMOUNT: &str = "s3.csi.aws.com/needs-unmount";

/// Annotation carrying the fingerprint hash, for debugging only.
pub const ANNOTATION_FINGERPRINT_HASH: &str = "s3.csi.aws.com/mount-fingerprint-hash";

/// Fixed bucket-name / volume-ID prefix dynamic provisioning must use.
pub const DYNAMIC_VOLUME_PREFIX: &str = "csi-s3-";

/// Default region used for dedicated-mode bucket creation when unspecified.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default deadline for `NodePublishVolume` (§4.6).
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 90;

/// Default cadence of the reconciler's stale-entry janitor and the background janitor (§4.5, §4.9).
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 120;

/// Default age after which an orphaned attachment entry is considered stale (§4.5).
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 120;

/// Default accept timeout for the mounter's options socket (§4.2).
pub const DEFAULT_TRANSPORT_ACCEPT_TIMEOUT_SECS: u64 = 120;

use std::path::Path;

use csi_s3_types::error::Result;
use csi_s3_types::DriverError;
use tracing::{debug, warn};

/// The `fstype` our FUSE process registers mounts under; used to distinguish our mounts from
/// anything else a target path might host.
const FUSE_FSTYPE_SIGNATURE: &str = "fuse.mount-s3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    /// No mount at this path at all.
    Absent,
    /// A live mount with our FUSE signature.
    Live,
    /// A mount entry exists but the path is unreachable (stale FUSE handle).
    Broken,
    /// A mount exists but isn't ours (unexpected, treated conservatively as not-absent).
    Foreign,
}

/// Reads and parses the host mount table (`/proc/mounts`), and inspects whether a path's mount
/// is healthy. Read frequently, written rarely (§5): writes are funneled through [`bind_mount`]
/// and [`unmount`], which this node process serializes per target path via the caller's
/// per-target lock (see `crate::publish`/`crate::unpublish`).
pub struct MountTable;

impl MountTable {
    /// Inspects `path`'s mount state (§4.6 steps 2-3).
    pub async fn state_of(path: &Path) -> Result<MountState> {
        let entries = Self::read_entries().await?;
        let Some(entry) = entries.into_iter().rev().find(|e| e.target == path.to_string_lossy()) else {
            return Ok(MountState::Absent);
        };
        if entry.fstype != FUSE_FSTYPE_SIGNATURE {
            return Ok(MountState::Foreign);
        }
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(MountState::Live),
            // A stale FUSE handle typically surfaces as ENOTCONN or ESTALE on stat.
            Err(e) if matches!(e.raw_os_error(), Some(107) | Some(116)) => {
                warn!(?path, error = %e, "mount looks broken (stale FUSE handle)");
                Ok(MountState::Broken)
            }
            Err(e) => Err(DriverError::Internal(format!("stat {}: {e}", path.display()))),
        }
    }

    async fn read_entries() -> Result<Vec<MountEntry>> {
        let raw = tokio::fs::read_to_string("/proc/mounts")
            .await
            .map_err(|e| DriverError::Internal(format!("reading /proc/mounts: {e}")))?;
        Ok(raw.lines().filter_map(MountEntry::parse).collect())
    }
}

struct MountEntry {
    target: String,
    fstype: String,
}

impl MountEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let _source = fields.next()?;
        let target = fields.next()?.to_owned();
        let fstype = fields.next()?.to_owned();
        Some(Self { target, fstype })
    }
}

/// Bind-mounts `source` onto `target` (§4.6 step 9). Shells out to the host `mount` binary, the
/// same approach the corpus uses for invoking FUSE/bind-mount tooling rather than wrapping the
/// mount(2) syscall directly.
pub async fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| DriverError::Internal(format!("creating bind mount target {}: {e}", target.display())))?;

    let source = source.to_owned();
    let target_for_cmd = target.to_owned();
    let output = tokio::task::spawn_blocking(move || {
        duct::cmd!("mount", "--bind", &source, &target_for_cmd).stderr_capture().unchecked().run()
    })
    .await
    .map_err(|e| DriverError::Internal(format!("bind mount task panicked: {e}")))?
    .map_err(|e| DriverError::Internal(format!("running mount --bind: {e}")))?;

    if !output.status.success() {
        return Err(DriverError::Internal(format!(
            "mount --bind {} {} failed: {}",
            source.display(),
            target.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    debug!(?source, ?target, "bind mount created");
    Ok(())
}

/// Removes the mount at `target` (§4.6 unpublish step 2). Idempotent: a target that is not a
/// mountpoint is a no-op.
pub async fn unmount(target: &Path) -> Result<()> {
    let target_for_cmd = target.to_owned();
    let output = tokio::task::spawn_blocking(move || {
        duct::cmd!("umount", &target_for_cmd).stderr_capture().unchecked().run()
    })
    .await
    .map_err(|e| DriverError::Internal(format!("unmount task panicked: {e}")))?
    .map_err(|e| DriverError::Internal(format!("running umount: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not mounted") {
            return Ok(());
        }
        return Err(DriverError::Internal(format!("umount {} failed: {stderr}", target.display())));
    }
    debug!(?target, "mount removed");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_well_formed_mounts_line() {
        let line = "mountpoint-s3 /var/lib/kubelet/plugins/s3.csi.aws.com/mnt/mp-1 fuse.mount-s3 rw,relatime 0 0";
        let entry = MountEntry::parse(line).unwrap();
        assert_eq!(entry.target, "/var/lib/kubelet/plugins/s3.csi.aws.com/mnt/mp-1");
        assert_eq!(entry.fstype, FUSE_FSTYPE_SIGNATURE);
    }

    #[test]
    fn rejects_a_malformed_line() {
        assert!(MountEntry::parse("").is_none());
    }
}

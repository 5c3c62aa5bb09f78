use std::path::PathBuf;

use csi_s3_proto::csi;
use csi_s3_types::error::Result;
use tracing::{info, instrument};

use crate::mount_table::{self, MountState, MountTable};

/// §4.6 unpublish algorithm: removes only the bind mount at `target_path`. The source mount and
/// mounter pod are left alone; their teardown belongs to the reconciler and janitor.
#[instrument(skip(req), fields(volume_id = %req.volume_id, target = %req.target_path))]
pub async fn unpublish(req: &csi::NodeUnpublishVolumeRequest) -> Result<()> {
    let target_path = PathBuf::from(&req.target_path);

    match MountTable::state_of(&target_path).await? {
        MountState::Absent => {
            info!("target was not mounted, unpublish is a no-op");
        }
        MountState::Live | MountState::Broken | MountState::Foreign => {
            mount_table::unmount(&target_path).await?;
        }
    }
    Ok(())
}

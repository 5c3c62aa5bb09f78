use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use csi_s3_proto::csi;
use csi_s3_types::error::Result;
use csi_s3_types::naming::mounter_pod_name;
use csi_s3_types::volume_context::VolumeContext;
use csi_s3_types::{DriverError, MountpointAttachment};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tracing::{info, instrument};

use crate::credentials::CredentialResolver;
use crate::mount_args;
use crate::mount_table::{self, MountState, MountTable};
use crate::transport;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct PublishContext<'a> {
    pub attachments: &'a Api<MountpointAttachment>,
    pub mounter_pods: &'a Api<Pod>,
    pub credentials: &'a CredentialResolver<'a>,
    pub plugin_root_dir: &'a str,
    pub publish_timeout: Duration,
}

#[instrument(skip(ctx, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
pub async fn publish(ctx: &PublishContext<'_>, req: &csi::NodePublishVolumeRequest) -> Result<()> {
    let access_mode = req
        .volume_capability
        .as_ref()
        .and_then(|c| c.access_mode.as_ref())
        .map(|m| m.mode)
        .unwrap_or_default();
    if access_mode == csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32 {
        return Err(DriverError::InvalidArgument(
            "single-writer access modes are not supported".to_owned(),
        ));
    }

    let target_path = PathBuf::from(&req.target_path);

    match MountTable::state_of(&target_path).await? {
        MountState::Live => {
            info!("target already a live mount, publish is a no-op");
            return Ok(());
        }
        MountState::Broken => {
            info!("target has a broken mount, unmounting before republish");
            mount_table::unmount(&target_path).await?;
        }
        MountState::Absent | MountState::Foreign => {}
    }

    let volume_context = VolumeContext::try_from(&req.volume_context)?;
    let pv_name = req
        .volume_context
        .get("csi.storage.k8s.io/pv/name")
        .cloned()
        .unwrap_or_else(|| req.volume_id.clone());
    let pod_name = mounter_pod_name(&req.workload_pod_uid, &pv_name);
    let source_path = PathBuf::from(format!(
        "{}/{}/{pod_name}",
        ctx.plugin_root_dir,
        csi_s3_utils::consts::SOURCE_MOUNT_SUBDIR
    ));

    let deadline = Instant::now() + ctx.publish_timeout;
    let record = wait_for_attachment(ctx, &pod_name, &req.workload_pod_uid, deadline).await?;
    wait_for_mounter_pod_running(ctx, &pod_name, deadline).await?;

    let auth_source = volume_context.authentication_source;
    let bundle = ctx.credentials.resolve(auth_source, &req.secrets).await?;

    if MountTable::state_of(&source_path).await? != MountState::Live {
        let socket_path = mounter_socket_path(ctx.plugin_root_dir, &pod_name);
        let requested_mount_options: Vec<String> = if record.spec.mount_options.is_empty() {
            Vec::new()
        } else {
            record.spec.mount_options.split(',').map(str::to_owned).collect()
        };
        let args = mount_args::apply_fs_group(
            mount_args::apply_policy(&requested_mount_options, "/tmp/credentials"),
            &req.fs_group,
        );
        let frame = csi_s3_types::OptionsFrame {
            argv: args,
            envp: credential_envp(&bundle),
            credential_files: credential_files(&bundle),
            fs_group: req.fs_group.clone(),
            bucket_name: volume_context.bucket_name.clone(),
            source_path: source_path.to_string_lossy().into_owned(),
        };
        transport::send_options(&socket_path, &frame, ctx.publish_timeout).await?;
        wait_for_source_mount(&source_path, deadline).await?;
    }

    mount_table::bind_mount(&source_path, &target_path).await?;
    Ok(())
}

fn mounter_socket_path(plugin_root_dir: &str, pod_name: &str) -> PathBuf {
    PathBuf::from(format!(
        "{plugin_root_dir}/{}/{pod_name}{}",
        csi_s3_utils::consts::SOURCE_MOUNT_SUBDIR,
        csi_s3_utils::consts::MOUNT_OPTIONS_SOCKET_PATH
    ))
}

/// Side-files the mounter agent must write to its tmpfs before exec (§4.2, §4.4). Only the CA
/// bundle is ever carried this way; the rest of the bundle travels as envp.
fn credential_files(bundle: &csi_s3_types::CredentialBundle) -> std::collections::HashMap<String, Vec<u8>> {
    let mut files = std::collections::HashMap::new();
    if let Some(ca_bundle) = &bundle.ca_bundle {
        files.insert(csi_s3_utils::consts::CA_BUNDLE_FILENAME.to_owned(), ca_bundle.clone());
    }
    files
}

fn credential_envp(bundle: &csi_s3_types::CredentialBundle) -> std::collections::HashMap<String, String> {
    let mut envp = std::collections::HashMap::new();
    envp.insert("AWS_ACCESS_KEY_ID".to_owned(), bundle.access_key_id.clone());
    envp.insert("AWS_SECRET_ACCESS_KEY".to_owned(), bundle.secret_access_key.clone());
    if let Some(token) = &bundle.session_token {
        envp.insert("AWS_SESSION_TOKEN".to_owned(), token.clone());
    }
    if let Some(region) = &bundle.region {
        envp.insert("AWS_REGION".to_owned(), region.clone());
    }
    envp
}

async fn wait_for_attachment(
    ctx: &PublishContext<'_>,
    pod_name: &str,
    workload_uid: &str,
    deadline: Instant,
) -> Result<MountpointAttachment> {
    loop {
        let records = ctx.attachments.list(&Default::default()).await.map_err(DriverError::from)?;
        let attached = records.items.into_iter().find(|record| {
            record
                .spec
                .mountpoint_pod_attachments
                .get(pod_name)
                .is_some_and(|attachments| attachments.iter().any(|a| a.workload_pod_uid == workload_uid))
        });
        if let Some(record) = attached {
            return Ok(record);
        }
        if Instant::now() >= deadline {
            return Err(DriverError::Unavailable(format!(
                "no attachment record for workload {workload_uid} / pod {pod_name} before deadline"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_mounter_pod_running(ctx: &PublishContext<'_>, pod_name: &str, deadline: Instant) -> Result<Pod> {
    loop {
        if let Some(pod) = ctx.mounter_pods.get_opt(pod_name).await.map_err(DriverError::from)? {
            let running = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running");
            if running {
                return Ok(pod);
            }
        }
        if Instant::now() >= deadline {
            return Err(DriverError::Unavailable(format!("mounter pod {pod_name} not Running before deadline")));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_source_mount(source_path: &Path, deadline: Instant) -> Result<()> {
    loop {
        if MountTable::state_of(source_path).await? == MountState::Live {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DriverError::Unavailable(format!(
                "source mount {} did not appear before deadline",
                source_path.display()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_node_writer_is_rejected() {
        let mode = csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32;
        assert_eq!(mode, 1);
    }
}

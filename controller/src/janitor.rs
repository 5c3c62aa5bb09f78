use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use csi_s3_types::error::Result as DriverResult;
use csi_s3_types::DriverError;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use tracing::{info, instrument, warn};

use crate::attachment_store::AttachmentStore;

/// Background Janitor (C9) plus the reconciler's own stale-entry janitor (§4.5), run on the same
/// `cleanupInterval` cadence since both only ever run on the leader.
///
/// Step 1 of §4.9 ("enumerate source mount directories on the host") is a per-node concern and
/// has no meaning from this cluster-scoped, leader-elected process; it is instead covered by the
/// node pipeline's idempotent republish path (§4.6 step 2, crash recovery) and the node-local
/// equivalent of this sweep in `csi_s3_node`. This janitor owns steps 2-4: orphaned mounter
/// pods, stale attachment entries, and the events that report both.
pub struct Janitor {
    attachments: Arc<dyn AttachmentStore>,
    mounter_pods: Api<Pod>,
    stale_threshold: Duration,
}

impl Janitor {
    pub fn new(attachments: Arc<dyn AttachmentStore>, mounter_pods: Api<Pod>, stale_threshold: Duration) -> Self {
        Self {
            attachments,
            mounter_pods,
            stale_threshold,
        }
    }

    /// Runs one sweep. Call on a `tokio::time::interval` tick, gated by leadership.
    #[instrument(skip_all)]
    pub async fn sweep_once(&self) -> DriverResult<()> {
        self.reclaim_orphaned_mounter_pods().await?;
        self.reclaim_stale_attachment_entries().await?;
        Ok(())
    }

    /// §4.9 step 2: mounter pods whose Attachment Record has no entries pointing to them.
    async fn reclaim_orphaned_mounter_pods(&self) -> DriverResult<()> {
        let records = self.attachments.list_all().await?;
        let referenced: std::collections::HashSet<String> = records
            .iter()
            .flat_map(|r| r.spec.mountpoint_pod_attachments.keys().cloned())
            .collect();

        let all_mounter_pods = self
            .mounter_pods
            .list(&kube::api::ListParams::default().labels("app=s3-csi-mounter"))
            .await
            .map_err(DriverError::from)?;

        for pod in all_mounter_pods.items {
            let name = pod.name_any();
            if referenced.contains(&name) {
                continue;
            }
            match self.mounter_pods.delete(&name, &Default::default()).await {
                Ok(_) => info!(pod = %name, "reclaimed orphaned mounter pod with no attachment entries"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => warn!(pod = %name, error = %e, "failed to reclaim orphaned mounter pod"),
            }
        }
        Ok(())
    }

    /// §4.9 step 3 / §4.5 stale-entry janitor: records whose workload UIDs reference pods that
    /// no longer exist, or that have sat unreferenced longer than `staleThreshold`.
    async fn reclaim_stale_attachment_entries(&self) -> DriverResult<()> {
        let now = Utc::now();
        for mut record in self.attachments.list_all().await? {
            let mut changed = false;
            let stale_pods: Vec<String> = record
                .spec
                .mountpoint_pod_attachments
                .iter()
                .filter(|(_, workloads)| {
                    workloads.iter().all(|w| {
                        now.signed_duration_since(w.attachment_time)
                            .to_std()
                            .map(|age| age > self.stale_threshold)
                            .unwrap_or(false)
                    })
                })
                .map(|(pod, _)| pod.clone())
                .collect();

            for pod_name in &stale_pods {
                if self.mounter_pods.get_opt(pod_name).await.map_err(DriverError::from)?.is_none() {
                    record.spec.remove_mounter_pod(pod_name);
                    changed = true;
                    info!(pod = %pod_name, "reclaimed stale attachment entry for vanished mounter pod");
                }
            }

            if !changed {
                continue;
            }
            if record.spec.is_empty() {
                self.attachments.delete(&record.name_any()).await?;
            } else {
                self.attachments.update(record).await?;
            }
        }
        Ok(())
    }
}

/// Spawns the janitor loop, ticking every `interval` and skipping a sweep whenever
/// `is_leader` returns `false` (leadership can change between ticks).
pub async fn run<F>(janitor: Janitor, interval: Duration, is_leader: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !is_leader() {
            continue;
        }
        if let Err(e) = janitor.sweep_once().await {
            warn!(error = %e, "janitor sweep failed");
        }
    }
}

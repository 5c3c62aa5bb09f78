use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use csi_s3_types::error::Result as DriverResult;
use csi_s3_types::{DriverError, Fingerprint, MountpointAttachment};
use csi_s3_utils::consts::{ANNOTATION_NEEDS_UNMOUNT, ANNOTATION_NO_NEW_WORKLOAD, DRIVER_VERSION_LABEL};
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{info, instrument, warn};

use crate::attachment_store::AttachmentStore;
use crate::harness::Reconciler;
use crate::pod_builder::{build_mounter_pod, PodBuilderConfig};
use crate::preconditions::NodeRegistrationChecker;

const MOUNTER_POD_LABEL: &str = "app";
const MOUNTER_POD_LABEL_VALUE: &str = "s3-csi-mounter";
const MAX_CONFLICT_RETRIES: u32 = 5;

/// One of the fingerprinted `PersistentVolume` claims a workload pod references, resolved down
/// to everything the attach branch (§4.5 step 4) needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    pub fingerprint: Fingerprint,
}

/// Pure: extracts the fingerprint for one of this pod's volumes bound to `pv`, which must
/// already be confirmed to belong to our driver (§4.5 step 2a/2b). No I/O.
pub fn compute_fingerprint(pod: &Pod, pv: &PersistentVolume, driver_name: &str) -> Option<Fingerprint> {
    let csi = pv.spec.as_ref()?.csi.as_ref()?;
    if csi.driver != driver_name {
        return None;
    }
    let node_name = pod.spec.as_ref()?.node_name.clone()?;
    let mount_options = Fingerprint::canonicalise_mount_options(
        pv.spec.as_ref().and_then(|s| s.mount_options.clone()).unwrap_or_default(),
    );
    let workload_fs_group = pod
        .spec
        .as_ref()
        .and_then(|s| s.security_context.as_ref())
        .and_then(|sc| sc.fs_group)
        .map(|g| g.to_string())
        .unwrap_or_default();
    let authentication_source = csi
        .volume_attributes
        .as_ref()
        .and_then(|attrs| attrs.get("authenticationSource"))
        .cloned()
        .unwrap_or_else(|| "driver".to_owned());
    let workload_service_account = pod
        .spec
        .as_ref()
        .and_then(|s| s.service_account_name.clone())
        .unwrap_or_else(|| "default".to_owned());

    Some(Fingerprint {
        node_name,
        persistent_volume_name: pv.name_any(),
        volume_id: csi.volume_handle.clone(),
        mount_options,
        workload_fs_group,
        authentication_source,
        workload_namespace: pod.namespace().unwrap_or_default(),
        workload_service_account,
    })
}

/// Whether a workload pod is on the detach branch (§4.5 step 2c): terminal phase or marked for
/// deletion.
pub fn is_workload_inactive(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// A mounter pod's eligibility signals, as read off the live `Pod` object (§4.5 step 4).
#[derive(Debug, Clone)]
pub struct MounterPodCandidate {
    pub name: String,
    pub running: bool,
    pub needs_unmount: bool,
    pub no_new_workload: bool,
    pub driver_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachDecision {
    /// The workload UID is already present in some pod's entry; nothing to do.
    AlreadyAttached,
    /// Append the workload UID to this existing, eligible mounter pod's entry.
    AttachToExisting(String),
    /// No eligible mounter pod exists; create one and attach.
    CreateNew,
}

/// Pure decision function for §4.5 step 4. `candidates` must be exactly the live `Pod` state for
/// every mounter pod name already present in `record`'s map (the reconciler fetches those before
/// calling this).
pub fn decide_attach(
    record: Option<&MountpointAttachment>,
    workload_uid: &str,
    candidates: &[MounterPodCandidate],
    driver_version: &str,
) -> AttachDecision {
    let Some(record) = record else {
        return AttachDecision::CreateNew;
    };
    if record.spec.find_mounter_pod_for_workload(workload_uid).is_some() {
        return AttachDecision::AlreadyAttached;
    }
    candidates
        .iter()
        .find(|c| c.running && !c.needs_unmount && !c.no_new_workload && c.driver_version == driver_version)
        .map(|c| AttachDecision::AttachToExisting(c.name.clone()))
        .unwrap_or(AttachDecision::CreateNew)
}

/// Outcome of applying the detach branch (§4.5 step 5) to one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetachOutcome {
    pub pods_to_mark_needs_unmount: Vec<String>,
    pub record_now_empty: bool,
}

/// Pure: mutates `record` in place per the detach branch, returning what the glue code must do
/// to the cluster as a result (annotate pods, maybe delete the record).
pub fn apply_detach(record: &mut MountpointAttachment, workload_uid: &str) -> DetachOutcome {
    let emptied = record.spec.detach_workload(workload_uid);
    for pod_name in &emptied {
        record.spec.remove_mounter_pod(pod_name);
    }
    DetachOutcome {
        pods_to_mark_needs_unmount: emptied,
        record_now_empty: record.spec.is_empty(),
    }
}

pub struct PodReconcilerConfig {
    pub driver_name: String,
    pub driver_version: String,
    pub mounter_namespace: String,
    pub pod_builder: PodBuilderConfig,
}

/// The Pod Reconciler (C5), driven by [`crate::harness::run`] over a `Pod` watch stream covering
/// both workload pods and mounter pods (terminal-mounter-pod cleanup, §4.5, runs through the
/// same entry point when the incoming pod carries the mounter label).
pub struct PodReconciler {
    attachments: Arc<dyn AttachmentStore>,
    client: Client,
    mounter_pods: Api<Pod>,
    pvs: Api<PersistentVolume>,
    preconditions: NodeRegistrationChecker,
    cfg: PodReconcilerConfig,
    is_leader: Arc<std::sync::atomic::AtomicBool>,
}

impl PodReconciler {
    pub fn new(
        attachments: Arc<dyn AttachmentStore>,
        client: Client,
        mounter_pods: Api<Pod>,
        pvs: Api<PersistentVolume>,
        preconditions: NodeRegistrationChecker,
        cfg: PodReconcilerConfig,
        is_leader: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            attachments,
            client,
            mounter_pods,
            pvs,
            preconditions,
            cfg,
            is_leader,
        }
    }

    fn is_mounter_pod(pod: &Pod) -> bool {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(MOUNTER_POD_LABEL))
            .map(|v| v == MOUNTER_POD_LABEL_VALUE)
            .unwrap_or(false)
    }

    #[instrument(skip_all, fields(pod = %pod.name_any()))]
    async fn handle_terminal_mounter_pod(&self, pod: &Pod) -> DriverResult<Action> {
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if !matches!(phase, Some("Succeeded") | Some("Failed")) {
            return Ok(Action::await_change());
        }
        let pod_name = pod.name_any();
        for record in self.attachments.list_all().await? {
            if !record.spec.mountpoint_pod_attachments.contains_key(&pod_name) {
                continue;
            }
            let mut updated = record;
            updated.spec.remove_mounter_pod(&pod_name);
            if updated.spec.is_empty() {
                self.attachments.delete(&updated.name_any()).await?;
            } else {
                self.attachments.update(updated).await?;
            }
        }
        match self.mounter_pods.delete(&pod_name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(DriverError::from(e)),
        }
        info!(pod = %pod_name, "reclaimed terminal mounter pod");
        Ok(Action::await_change())
    }

    #[instrument(skip_all, fields(pod = %pod.name_any(), namespace = pod.namespace().as_deref()))]
    async fn handle_workload_pod(&self, pod: &Pod) -> DriverResult<Action> {
        let Some(uid) = pod.uid() else {
            return Ok(Action::await_change());
        };

        if is_workload_inactive(pod) {
            return self.detach_everywhere(&uid).await;
        }

        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            // Not yet scheduled; nothing to do until it is.
            return Ok(Action::requeue(Duration::from_secs(5)));
        };

        for fingerprint in self.our_fingerprints(pod).await? {
            if !self
                .preconditions
                .is_csi_node_advertised(&node_name)
                .await
                .map_err(DriverError::from)?
            {
                warn!(node_name, "CSIDaemonMissing: node service not advertised yet");
                return Ok(Action::requeue(Duration::from_secs(15)));
            }
            self.attach(&fingerprint, &uid).await?;
        }
        Ok(Action::await_change())
    }

    async fn our_fingerprints(&self, pod: &Pod) -> DriverResult<Vec<Fingerprint>> {
        let mut out = Vec::new();
        let Some(spec) = pod.spec.as_ref() else {
            return Ok(out);
        };
        for volume in spec.volumes.iter().flatten() {
            let Some(claim) = volume.persistent_volume_claim.as_ref() else {
                continue;
            };
            // The PV binding is resolved through the claim's `volumeName` status field, which
            // the caller is expected to have populated via the orchestrator's binder; we treat a
            // not-yet-bound claim as "not ours yet" rather than an error.
            let pv_name = match self.bound_pv_name(pod.namespace().as_deref(), &claim.claim_name).await? {
                Some(n) => n,
                None => continue,
            };
            let pv = match self.pvs.get_opt(&pv_name).await.map_err(DriverError::from)? {
                Some(pv) => pv,
                None => continue,
            };
            if let Some(fp) = compute_fingerprint(pod, &pv, &self.cfg.driver_name) {
                out.push(fp);
            }
        }
        Ok(out)
    }

    async fn bound_pv_name(&self, namespace: Option<&str>, claim_name: &str) -> DriverResult<Option<String>> {
        let Some(namespace) = namespace else {
            return Ok(None);
        };
        let pvcs: Api<k8s_openapi::api::core::v1::PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), namespace);
        let claim = match pvcs.get_opt(claim_name).await.map_err(DriverError::from)? {
            Some(c) => c,
            None => return Ok(None),
        };
        Ok(claim.spec.and_then(|s| s.volume_name))
    }

    async fn attach(&self, fingerprint: &Fingerprint, workload_uid: &str) -> DriverResult<()> {
        for attempt in 0..MAX_CONFLICT_RETRIES {
            let existing = self.attachments.find_by_fingerprint(fingerprint).await?;
            let candidates = self.live_candidates(&existing).await?;
            let decision = decide_attach(
                existing.as_ref(),
                workload_uid,
                &candidates,
                &self.cfg.driver_version,
            );

            let result = match (decision, existing) {
                (AttachDecision::AlreadyAttached, _) => Ok(()),
                (AttachDecision::AttachToExisting(pod_name), Some(mut record)) => {
                    record.spec.attach(&pod_name, workload_uid, Utc::now());
                    self.attachments.update(record).await.map(|_| ())
                }
                (AttachDecision::CreateNew, existing) => {
                    self.create_mounter_pod_and_attach(fingerprint, workload_uid, existing).await
                }
                (AttachDecision::AttachToExisting(_), None) => unreachable!("existing is Some whenever AttachToExisting is chosen"),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(DriverError::Conflict(msg)) => {
                    warn!(attempt, %msg, "attachment record conflict, rereading and retrying");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        Err(DriverError::Unavailable(format!(
            "exhausted {MAX_CONFLICT_RETRIES} conflict retries attaching workload {workload_uid}"
        )))
    }

    async fn live_candidates(&self, existing: &Option<MountpointAttachment>) -> DriverResult<Vec<MounterPodCandidate>> {
        let Some(existing) = existing else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for pod_name in existing.spec.mountpoint_pod_attachments.keys() {
            let Some(pod) = self.mounter_pods.get_opt(pod_name).await.map_err(DriverError::from)? else {
                continue;
            };
            out.push(MounterPodCandidate {
                name: pod_name.clone(),
                running: pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"),
                needs_unmount: pod_annotation_flag(&pod, ANNOTATION_NEEDS_UNMOUNT),
                no_new_workload: pod_annotation_flag(&pod, ANNOTATION_NO_NEW_WORKLOAD),
                driver_version: pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(DRIVER_VERSION_LABEL))
                    .cloned()
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn create_mounter_pod_and_attach(
        &self,
        fingerprint: &Fingerprint,
        workload_uid: &str,
        existing: Option<MountpointAttachment>,
    ) -> DriverResult<()> {
        let pod_name = csi_s3_types::naming::mounter_pod_name(workload_uid, &fingerprint.persistent_volume_name);
        let pod = build_mounter_pod(&pod_name, fingerprint, &self.cfg.pod_builder);
        match self.mounter_pods.create(&Default::default(), &pod).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 409 => {} // already exists, likely our own retry
            Err(e) => return Err(DriverError::from(e)),
        }

        let mut record = existing.unwrap_or_else(|| {
            let name = format!("{}-{}", self.cfg.mounter_namespace, csi_s3_types::naming::attachment_record_name(fingerprint));
            let mut record = MountpointAttachment::new(&name, csi_s3_types::MountpointAttachmentSpec::new(fingerprint));
            record.metadata.labels = Some(record.spec.index_labels());
            record
        });
        record.spec.attach(&pod_name, workload_uid, Utc::now());

        if record.resource_version().is_some() {
            self.attachments.update(record).await.map(|_| ())
        } else {
            self.attachments.create(record).await.map(|_| ())
        }
    }

    async fn detach_everywhere(&self, workload_uid: &str) -> DriverResult<Action> {
        for record in self.attachments.list_all().await? {
            if record.spec.find_mounter_pod_for_workload(workload_uid).is_none() {
                continue;
            }
            let mut updated = record;
            let outcome = apply_detach(&mut updated, workload_uid);
            for pod_name in &outcome.pods_to_mark_needs_unmount {
                self.mark_needs_unmount(pod_name).await?;
            }
            if outcome.record_now_empty {
                self.attachments.delete(&updated.name_any()).await?;
            } else {
                self.attachments.update(updated).await?;
            }
        }
        Ok(Action::await_change())
    }

    async fn mark_needs_unmount(&self, pod_name: &str) -> DriverResult<()> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { ANNOTATION_NEEDS_UNMOUNT: "true" } }
        });
        match self
            .mounter_pods
            .patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(DriverError::from(e)),
        }
    }
}

fn pod_annotation_flag(pod: &Pod, key: &str) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|v| v == "true")
        .unwrap_or(false)
}

#[async_trait]
impl Reconciler<Pod> for PodReconciler {
    type Error = DriverError;

    async fn reconcile_once(&self, pod: Arc<Pod>) -> Result<Action, Self::Error> {
        if !self.is_leader.load(std::sync::atomic::Ordering::Relaxed) {
            // Only the leader may mutate Attachment Records or mounter pods (§4.1, §5).
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        if Self::is_mounter_pod(&pod) {
            self.handle_terminal_mounter_pod(&pod).await
        } else {
            self.handle_workload_pod(&pod).await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use csi_s3_types::MountpointAttachmentSpec;

    fn fp() -> Fingerprint {
        Fingerprint {
            node_name: "node-1".into(),
            persistent_volume_name: "pv-1".into(),
            volume_id: "csi-s3-abc".into(),
            mount_options: "".into(),
            workload_fs_group: "".into(),
            authentication_source: "driver".into(),
            workload_namespace: "default".into(),
            workload_service_account: "default".into(),
        }
    }

    fn record_with(attached: &[(&str, &str)]) -> MountpointAttachment {
        let mut spec = MountpointAttachmentSpec::new(&fp());
        for (pod, uid) in attached {
            spec.attach(pod, uid, Utc::now());
        }
        MountpointAttachment::new("rec-1", spec)
    }

    #[test]
    fn no_record_creates_new() {
        let decision = decide_attach(None, "w1", &[], "1.0.0");
        assert_eq!(decision, AttachDecision::CreateNew);
    }

    #[test]
    fn already_attached_is_a_noop() {
        let record = record_with(&[("mp-1", "w1")]);
        let decision = decide_attach(Some(&record), "w1", &[], "1.0.0");
        assert_eq!(decision, AttachDecision::AlreadyAttached);
    }

    #[test]
    fn picks_first_eligible_pod() {
        let record = record_with(&[("mp-1", "w1")]);
        let candidates = vec![MounterPodCandidate {
            name: "mp-1".into(),
            running: true,
            needs_unmount: false,
            no_new_workload: false,
            driver_version: "1.0.0".into(),
        }];
        let decision = decide_attach(Some(&record), "w2", &candidates, "1.0.0");
        assert_eq!(decision, AttachDecision::AttachToExisting("mp-1".into()));
    }

    #[test]
    fn draining_pod_is_not_eligible() {
        let record = record_with(&[("mp-1", "w1")]);
        let candidates = vec![MounterPodCandidate {
            name: "mp-1".into(),
            running: true,
            needs_unmount: true,
            no_new_workload: false,
            driver_version: "1.0.0".into(),
        }];
        let decision = decide_attach(Some(&record), "w2", &candidates, "1.0.0");
        assert_eq!(decision, AttachDecision::CreateNew);
    }

    #[test]
    fn version_mismatch_forces_new_pod() {
        let record = record_with(&[("mp-1", "w1")]);
        let candidates = vec![MounterPodCandidate {
            name: "mp-1".into(),
            running: true,
            needs_unmount: false,
            no_new_workload: false,
            driver_version: "0.9.0".into(),
        }];
        let decision = decide_attach(Some(&record), "w2", &candidates, "1.0.0");
        assert_eq!(decision, AttachDecision::CreateNew);
    }

    #[test]
    fn detach_empties_and_marks_record() {
        let mut record = record_with(&[("mp-1", "w1")]);
        let outcome = apply_detach(&mut record, "w1");
        assert_eq!(outcome.pods_to_mark_needs_unmount, vec!["mp-1".to_owned()]);
        assert!(outcome.record_now_empty);
    }

    #[test]
    fn detach_of_one_workload_leaves_others_attached() {
        let mut record = record_with(&[("mp-1", "w1"), ("mp-1", "w2")]);
        let outcome = apply_detach(&mut record, "w1");
        assert!(outcome.pods_to_mark_needs_unmount.is_empty());
        assert!(!outcome.record_now_empty);
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// One workload's attachment to a mounter pod (§3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorkloadAttachment {
    pub workload_pod_uid: String,
    pub attachment_time: DateTime<Utc>,
}

/// The Attachment Record (C1, §3/§6): a cluster-scoped object mapping a fingerprint to the set
/// of mounter pods serving it, each with the workload UIDs currently attached to it.
///
/// Cluster-scoped because a fingerprint already encodes the node; namespacing the record would
/// only complicate the "at most one record per fingerprint" invariant (§3 invariant a) for no
/// benefit.
///
/// `node_name`, `persistent_volume_name`, `volume_id`, `mount_options`, and `workload_fs_group`
/// are mirrored onto labels (see [`MountpointAttachmentSpec::index_labels`]) so the server-side
/// field selection required by §6 can be done with `kube`'s label selectors; `kube` does not
/// offer secondary indexes on arbitrary spec fields for CRDs the way it does for core types.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "s3.csi.aws.com",
    version = "v1",
    kind = "MountpointAttachment",
    plural = "mountpointattachments",
    singular = "mountpointattachment",
    status = "MountpointAttachmentStatus",
    derive = "PartialEq"
)]
pub struct MountpointAttachmentSpec {
    pub node_name: String,
    pub persistent_volume_name: String,
    pub volume_id: String,
    pub mount_options: String,
    pub workload_fs_group: String,
    pub authentication_source: String,
    pub workload_namespace: String,
    pub workload_service_account: String,
    pub mountpoint_pod_attachments: BTreeMap<String, Vec<WorkloadAttachment>>,
}

/// No status subresource content is required by the spec; kept as an empty struct so the CRD
/// can still opt into the status subresource (separating spec writes from status writes is
/// standard practice, even though this driver currently has no status fields to report).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MountpointAttachmentStatus {}

impl MountpointAttachmentSpec {
    pub fn new(fingerprint: &Fingerprint) -> Self {
        Self {
            node_name: fingerprint.node_name.clone(),
            persistent_volume_name: fingerprint.persistent_volume_name.clone(),
            volume_id: fingerprint.volume_id.clone(),
            mount_options: fingerprint.mount_options.clone(),
            workload_fs_group: fingerprint.workload_fs_group.clone(),
            authentication_source: fingerprint.authentication_source.clone(),
            workload_namespace: fingerprint.workload_namespace.clone(),
            workload_service_account: fingerprint.workload_service_account.clone(),
            mountpoint_pod_attachments: BTreeMap::new(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            node_name: self.node_name.clone(),
            persistent_volume_name: self.persistent_volume_name.clone(),
            volume_id: self.volume_id.clone(),
            mount_options: self.mount_options.clone(),
            workload_fs_group: self.workload_fs_group.clone(),
            authentication_source: self.authentication_source.clone(),
            workload_namespace: self.workload_namespace.clone(),
            workload_service_account: self.workload_service_account.clone(),
        }
    }

    /// Labels that mirror the indexed fields named in §6, so they can be used in a field/label
    /// selector when listing records.
    pub fn index_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("s3.csi.aws.com/node-name".to_owned(), self.node_name.clone()),
            (
                "s3.csi.aws.com/pv-name".to_owned(),
                self.persistent_volume_name.clone(),
            ),
            ("s3.csi.aws.com/volume-id".to_owned(), self.volume_id.clone()),
            (
                "s3.csi.aws.com/fs-group".to_owned(),
                if self.workload_fs_group.is_empty() {
                    "none".to_owned()
                } else {
                    self.workload_fs_group.clone()
                },
            ),
        ])
    }

    /// The reference count of a mounter pod: the number of distinct workload UIDs attached to
    /// it (§3 invariant c).
    pub fn mounter_pod_ref_count(&self, mounter_pod_name: &str) -> usize {
        self.mountpoint_pod_attachments
            .get(mounter_pod_name)
            .map_or(0, Vec::len)
    }

    /// Attach a workload to a mounter pod's entry. A no-op if the workload UID is already
    /// present (the Open Question in §9 is resolved by treating duplicates as the same
    /// attachment).
    pub fn attach(&mut self, mounter_pod_name: &str, workload_pod_uid: &str, now: DateTime<Utc>) {
        let entry = self
            .mountpoint_pod_attachments
            .entry(mounter_pod_name.to_owned())
            .or_default();
        if !entry.iter().any(|a| a.workload_pod_uid == workload_pod_uid) {
            entry.push(WorkloadAttachment {
                workload_pod_uid: workload_pod_uid.to_owned(),
                attachment_time: now,
            });
        }
    }

    /// Remove a workload UID from whichever mounter-pod entries contain it. Returns the names
    /// of mounter pods whose entry became empty as a result.
    pub fn detach_workload(&mut self, workload_pod_uid: &str) -> Vec<String> {
        let mut emptied = Vec::new();
        for (pod_name, attachments) in self.mountpoint_pod_attachments.iter_mut() {
            attachments.retain(|a| a.workload_pod_uid != workload_pod_uid);
            if attachments.is_empty() {
                emptied.push(pod_name.clone());
            }
        }
        emptied
    }

    /// Drop a mounter pod's entry entirely (used once it has been deleted).
    pub fn remove_mounter_pod(&mut self, mounter_pod_name: &str) {
        self.mountpoint_pod_attachments.remove(mounter_pod_name);
    }

    /// Whether any workload is attached anywhere in this record.
    pub fn is_empty(&self) -> bool {
        self.mountpoint_pod_attachments
            .values()
            .all(Vec::is_empty)
    }

    /// Find the mounter pod (if any) that has `workload_pod_uid` attached.
    pub fn find_mounter_pod_for_workload(&self, workload_pod_uid: &str) -> Option<&str> {
        self.mountpoint_pod_attachments
            .iter()
            .find(|(_, attachments)| attachments.iter().any(|a| a.workload_pod_uid == workload_pod_uid))
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::MountpointAttachmentSpec;
    use crate::fingerprint::Fingerprint;

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

    #[test]
    fn attach_is_idempotent_per_workload() {
        let mut spec = MountpointAttachmentSpec::new(&fp());
        let now = Utc::now();
        spec.attach("mp-1", "w1", now);
        spec.attach("mp-1", "w1", now);
        assert_eq!(spec.mounter_pod_ref_count("mp-1"), 1);
    }

    #[test]
    fn detach_reports_emptied_pods() {
        let mut spec = MountpointAttachmentSpec::new(&fp());
        let now = Utc::now();
        spec.attach("mp-1", "w1", now);
        spec.attach("mp-1", "w2", now);
        let emptied = spec.detach_workload("w1");
        assert!(emptied.is_empty());
        assert_eq!(spec.mounter_pod_ref_count("mp-1"), 1);

        let emptied = spec.detach_workload("w2");
        assert_eq!(emptied, vec!["mp-1".to_owned()]);
        assert!(spec.is_empty());
    }

    #[test]
    fn find_mounter_pod_for_workload_round_trips() {
        let mut spec = MountpointAttachmentSpec::new(&fp());
        spec.attach("mp-1", "w1", Utc::now());
        assert_eq!(spec.find_mounter_pod_for_workload("w1"), Some("mp-1"));
        assert_eq!(spec.find_mounter_pod_for_workload("w2"), None);
    }
}

use async_trait::async_trait;
use csi_s3_types::{error::Result, DriverError, Fingerprint, MountpointAttachment};
use kube::api::PostParams;
use kube::{Api, Resource, ResourceExt};

/// The Attachment Record store (C1, §4.1). Abstracted behind a trait so the reconciler's
/// decision logic (§4.5) can be unit-tested against an in-memory fake instead of a live API
/// server, per the design notes on encapsulating the one piece of cross-component shared state
/// behind a typed repository.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<MountpointAttachment>>;
    async fn find_by_node_and_pv(
        &self,
        node: &str,
        pv: &str,
    ) -> Result<Vec<MountpointAttachment>>;
    async fn list_all(&self) -> Result<Vec<MountpointAttachment>>;
    async fn create(&self, record: MountpointAttachment) -> Result<MountpointAttachment>;
    /// Test-and-set update: `record` must carry the `resourceVersion` it was read with. A lost
    /// update surfaces as `DriverError::Conflict` (§4.1).
    async fn update(&self, record: MountpointAttachment) -> Result<MountpointAttachment>;
    async fn delete(&self, name: &str) -> Result<()>;
}

pub struct KubeAttachmentStore {
    api: Api<MountpointAttachment>,
}

impl KubeAttachmentStore {
    pub fn new(api: Api<MountpointAttachment>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl AttachmentStore for KubeAttachmentStore {
    async fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<MountpointAttachment>> {
        // `kube` has no native secondary index for CRDs; list with a label selector mirroring
        // the node/pv/volume-id/fs-group fields (cheap, server-side) and then confirm equality
        // on the remaining fingerprint fields locally — still correct, since `spec matching fp`
        // (§8 invariant 2) requires an exact match on every field, not just the indexed subset.
        let candidates = self.find_by_node_and_pv(&fp.node_name, &fp.persistent_volume_name).await?;
        Ok(candidates.into_iter().find(|r| &r.spec.fingerprint() == fp))
    }

    async fn find_by_node_and_pv(
        &self,
        node: &str,
        pv: &str,
    ) -> Result<Vec<MountpointAttachment>> {
        let selector = format!(
            "s3.csi.aws.com/node-name={node},s3.csi.aws.com/pv-name={pv}",
            node = sanitize_label_value(node),
            pv = sanitize_label_value(pv),
        );
        let params = kube::api::ListParams::default().labels(&selector);
        let list = self.api.list(&params).await?;
        Ok(list.items)
    }

    async fn list_all(&self) -> Result<Vec<MountpointAttachment>> {
        let list = self.api.list(&kube::api::ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, mut record: MountpointAttachment) -> Result<MountpointAttachment> {
        record.meta_mut().labels.get_or_insert_with(Default::default).extend(record.spec.index_labels());
        self.api
            .create(&PostParams::default(), &record)
            .await
            .map_err(DriverError::from)
    }

    async fn update(&self, record: MountpointAttachment) -> Result<MountpointAttachment> {
        let name = record.name_any();
        if record.resource_version().is_none() {
            return Err(DriverError::Internal("update called without a resourceVersion".into()));
        }
        // `replace` round-trips the object's `resourceVersion`; the API server rejects the
        // write with a 409 if it has moved since `record` was read, which is exactly the
        // test-and-set CAS behaviour §4.1 requires.
        self.api.replace(&name, &PostParams::default(), &record).await.map_err(|e| match e {
            kube::Error::Api(api_err) if api_err.code == 409 => {
                DriverError::Conflict(format!("attachment record {name} was updated concurrently"))
            }
            other => DriverError::from(other),
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(DriverError::from(e)),
        }
    }
}

fn sanitize_label_value(raw: &str) -> String {
    // Kubernetes label values are restricted to alnum, '-', '_', '.'; anything else (mostly
    // just defensive here, since node/pv names are already DNS-safe) is mapped to '-'.
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .collect()
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory `AttachmentStore` used to unit-test the reconciler's decision logic (§8)
    /// without a live API server.
    #[derive(Default)]
    pub struct FakeAttachmentStore {
        records: Mutex<HashMap<String, MountpointAttachment>>,
        next_version: Mutex<u64>,
    }

    impl FakeAttachmentStore {
        fn bump_version(&self) -> String {
            let mut v = self.next_version.lock().unwrap();
            *v += 1;
            v.to_string()
        }
    }

    #[async_trait]
    impl AttachmentStore for FakeAttachmentStore {
        async fn find_by_fingerprint(&self, fp: &Fingerprint) -> Result<Option<MountpointAttachment>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .find(|r| &r.spec.fingerprint() == fp)
                .cloned())
        }

        async fn find_by_node_and_pv(
            &self,
            node: &str,
            pv: &str,
        ) -> Result<Vec<MountpointAttachment>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.spec.node_name == node && r.spec.persistent_volume_name == pv)
                .cloned()
                .collect())
        }

        async fn list_all(&self) -> Result<Vec<MountpointAttachment>> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn create(&self, mut record: MountpointAttachment) -> Result<MountpointAttachment> {
            let name = record.name_any();
            let mut records = self.records.lock().unwrap();
            if records.contains_key(&name) {
                return Err(DriverError::AlreadyExists(name));
            }
            record.meta_mut().resource_version = Some(self.bump_version());
            records.insert(name, record.clone());
            Ok(record)
        }

        async fn update(&self, record: MountpointAttachment) -> Result<MountpointAttachment> {
            let name = record.name_any();
            let mut records = self.records.lock().unwrap();
            let Some(existing) = records.get(&name) else {
                return Err(DriverError::NotFound(name));
            };
            if existing.resource_version() != record.resource_version() {
                return Err(DriverError::Conflict(name));
            }
            let mut updated = record;
            updated.meta_mut().resource_version = Some(self.bump_version());
            records.insert(name, updated.clone());
            Ok(updated)
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.records.lock().unwrap().remove(name);
            Ok(())
        }
    }
}

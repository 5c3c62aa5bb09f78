use std::collections::BTreeMap;

use async_trait::async_trait;
use csi_s3_types::error::Result;
use csi_s3_types::DriverError;
use csi_s3_proto::csi::Volume;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};

const FIELD_MANAGER: &str = "s3-csi-controller";

/// Persists the `CreateVolume` idempotency mapping (§4.8: "Implementations SHOULD persist
/// name→volumeID mapping in storage they control"). Each entry is serialized as one
/// `ConfigMap` data key so a single registry object backs every volume name.
#[async_trait]
pub trait VolumeRegistry: Send + Sync {
    async fn lookup_by_name(&self, name: &str) -> Result<Option<Volume>>;
    async fn lookup_by_volume_id(&self, volume_id: &str) -> Result<Option<Volume>>;
    /// The `volumes/<id>/` prefix recorded at creation time, if this volume was provisioned in
    /// shared-bucket mode.
    async fn shared_prefix_for(&self, volume_id: &str) -> Result<Option<String>>;
    /// The `CreateVolume` request parameters recorded at creation time, for the idempotency
    /// comparison on a repeated `CreateVolume` call with the same name (§4.8, §7).
    async fn parameters_for_name(&self, name: &str) -> Result<Option<BTreeMap<String, String>>>;
    async fn record(&self, name: &str, volume: Volume, parameters: &BTreeMap<String, String>) -> Result<()>;
    async fn forget(&self, volume_id: &str) -> Result<()>;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Entry {
    name: String,
    volume_id: String,
    capacity_bytes: i64,
    volume_context: BTreeMap<String, String>,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

impl Entry {
    fn into_volume(self) -> Volume {
        Volume {
            capacity_bytes: self.capacity_bytes,
            volume_id: self.volume_id,
            volume_context: self.volume_context.into_iter().collect(),
        }
    }
}

pub struct ConfigMapVolumeRegistry {
    configmaps: Api<ConfigMap>,
    name: String,
}

impl ConfigMapVolumeRegistry {
    pub fn new(configmaps: Api<ConfigMap>, name: String) -> Self {
        Self { configmaps, name }
    }

    async fn entries(&self) -> Result<BTreeMap<String, String>> {
        match self.configmaps.get_opt(&self.name).await.map_err(DriverError::from)? {
            Some(cm) => Ok(cm.data.unwrap_or_default()),
            None => Ok(BTreeMap::new()),
        }
    }

    fn decode(raw: &str) -> Option<Entry> {
        serde_json::from_str(raw).ok()
    }
}

#[async_trait]
impl VolumeRegistry for ConfigMapVolumeRegistry {
    async fn lookup_by_name(&self, name: &str) -> Result<Option<Volume>> {
        let entries = self.entries().await?;
        Ok(entries.get(name).and_then(|raw| Self::decode(raw)).map(Entry::into_volume))
    }

    async fn lookup_by_volume_id(&self, volume_id: &str) -> Result<Option<Volume>> {
        let entries = self.entries().await?;
        Ok(entries
            .values()
            .filter_map(|raw| Self::decode(raw))
            .find(|e| e.volume_id == volume_id)
            .map(Entry::into_volume))
    }

    async fn shared_prefix_for(&self, volume_id: &str) -> Result<Option<String>> {
        let entries = self.entries().await?;
        Ok(entries
            .values()
            .filter_map(|raw| Self::decode(raw))
            .find(|e| e.volume_id == volume_id)
            .and_then(|e| e.volume_context.get("prefix").cloned()))
    }

    async fn parameters_for_name(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let entries = self.entries().await?;
        Ok(entries.get(name).and_then(|raw| Self::decode(raw)).map(|e| e.parameters))
    }

    async fn record(&self, name: &str, volume: Volume, parameters: &BTreeMap<String, String>) -> Result<()> {
        let entry = Entry {
            name: name.to_owned(),
            volume_id: volume.volume_id,
            capacity_bytes: volume.capacity_bytes,
            volume_context: volume.volume_context.into_iter().collect(),
            parameters: parameters.clone(),
        };
        let serialized = serde_json::to_string(&entry)
            .map_err(|e| DriverError::Internal(format!("serializing volume registry entry: {e}")))?;
        let patch = serde_json::json!({ "data": { name: serialized } });
        match self
            .configmaps
            .patch(&self.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let mut cm = ConfigMap::default();
                cm.metadata.name = Some(self.name.clone());
                cm.data = Some(BTreeMap::from([(name.to_owned(), serialized)]));
                self.configmaps
                    .create(&PostParams::default(), &cm)
                    .await
                    .map(|_| ())
                    .map_err(DriverError::from)
            }
            Err(e) => Err(DriverError::from(e)),
        }
    }

    async fn forget(&self, volume_id: &str) -> Result<()> {
        let Some(mut cm) = self.configmaps.get_opt(&self.name).await.map_err(DriverError::from)? else {
            return Ok(());
        };
        let Some(data) = cm.data.as_mut() else {
            return Ok(());
        };
        let key = data
            .iter()
            .find(|(_, raw)| Self::decode(raw).map(|e| e.volume_id == volume_id).unwrap_or(false))
            .map(|(k, _)| k.clone());
        let Some(key) = key else {
            return Ok(());
        };
        data.remove(&key);
        self.configmaps
            .replace(&cm.name_any(), &PostParams::default(), &cm)
            .await
            .map(|_| ())
            .map_err(DriverError::from)
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeVolumeRegistry {
        by_name: Mutex<HashMap<String, Entry>>,
    }

    #[async_trait]
    impl VolumeRegistry for FakeVolumeRegistry {
        async fn lookup_by_name(&self, name: &str) -> Result<Option<Volume>> {
            Ok(self.by_name.lock().unwrap().get(name).map(|e| Entry {
                name: e.name.clone(),
                volume_id: e.volume_id.clone(),
                capacity_bytes: e.capacity_bytes,
                volume_context: e.volume_context.clone(),
                parameters: e.parameters.clone(),
            }.into_volume()))
        }

        async fn lookup_by_volume_id(&self, volume_id: &str) -> Result<Option<Volume>> {
            Ok(self
                .by_name
                .lock()
                .unwrap()
                .values()
                .find(|e| e.volume_id == volume_id)
                .map(|e| Entry {
                    name: e.name.clone(),
                    volume_id: e.volume_id.clone(),
                    capacity_bytes: e.capacity_bytes,
                    volume_context: e.volume_context.clone(),
                    parameters: e.parameters.clone(),
                }
                .into_volume()))
        }

        async fn shared_prefix_for(&self, volume_id: &str) -> Result<Option<String>> {
            Ok(self
                .by_name
                .lock()
                .unwrap()
                .values()
                .find(|e| e.volume_id == volume_id)
                .and_then(|e| e.volume_context.get("prefix").cloned()))
        }

        async fn parameters_for_name(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
            Ok(self.by_name.lock().unwrap().get(name).map(|e| e.parameters.clone()))
        }

        async fn record(&self, name: &str, volume: Volume, parameters: &BTreeMap<String, String>) -> Result<()> {
            self.by_name.lock().unwrap().insert(
                name.to_owned(),
                Entry {
                    name: name.to_owned(),
                    volume_id: volume.volume_id,
                    capacity_bytes: volume.capacity_bytes,
                    volume_context: volume.volume_context.into_iter().collect(),
                    parameters: parameters.clone(),
                },
            );
            Ok(())
        }

        async fn forget(&self, volume_id: &str) -> Result<()> {
            self.by_name.lock().unwrap().retain(|_, e| e.volume_id != volume_id);
            Ok(())
        }
    }
}

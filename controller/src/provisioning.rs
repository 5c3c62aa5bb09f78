use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use csi_s3_types::error::Result as DriverResult;
use csi_s3_types::{DriverError, VolumeId};
use tonic::{Request, Response, Status};
use tracing::instrument;

use csi_s3_proto::csi::controller_server::Controller;
use csi_s3_proto::csi::{
    CapacityRange, ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerServiceCapability, CreateVolumeRequest, CreateVolumeResponse, DeleteVolumeRequest,
    DeleteVolumeResponse, GetCapacityRequest, GetCapacityResponse, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability,
};

use crate::object_store::ObjectStore;
use crate::volume_registry::VolumeRegistry;

const DEFAULT_REGION: &str = "us-east-1";
/// S3 has no meaningful capacity ceiling from this driver's point of view; this is an
/// arbitrarily large sentinel (§4.8).
const CAPACITY_SENTINEL_BYTES: i64 = i64::MAX;

/// Dynamic-Provisioning Controller (C8): the `Controller` gRPC service. Business-logic decisions
/// (dedicated vs shared mode, idempotency, delete-safety) are pure helper functions below so they
/// can be unit-tested without a tonic `Request`/`Response` wrapper.
pub struct ProvisioningService {
    volumes: Arc<dyn VolumeRegistry>,
    objects: Arc<dyn ObjectStore>,
    default_region: String,
    is_leader: Arc<std::sync::atomic::AtomicBool>,
}

impl ProvisioningService {
    pub fn new(
        volumes: Arc<dyn VolumeRegistry>,
        objects: Arc<dyn ObjectStore>,
        is_leader: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            volumes,
            objects,
            default_region: DEFAULT_REGION.to_owned(),
            is_leader,
        }
    }

    /// Only the leader may mutate Attachment Records or buckets (§4.1, §5). Non-mutating RPCs
    /// (`ValidateVolumeCapabilities`, `GetCapacity`, capability advertisement) are answered by
    /// every replica.
    fn require_leader(&self) -> Result<(), Status> {
        if self.is_leader.load(std::sync::atomic::Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Status::failed_precondition("this replica is not currently the leader"))
        }
    }

    #[instrument(skip_all, fields(name = %req.name))]
    async fn create_volume_inner(&self, req: &CreateVolumeRequest) -> DriverResult<Volume> {
        if let Some(existing) = self.volumes.lookup_by_name(&req.name).await? {
            let existing_parameters = self.volumes.parameters_for_name(&req.name).await?.unwrap_or_default();
            let requested_parameters: BTreeMap<String, String> =
                req.parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            if capacity_satisfied(existing.capacity_bytes, req.capacity_range.as_ref())
                && existing_parameters == requested_parameters
            {
                return Ok(existing);
            }
            return Err(DriverError::AlreadyExists(format!(
                "volume {} already exists with a different capacity or parameters",
                req.name
            )));
        }

        let volume_id = VolumeId::generate();
        let mode = ProvisioningMode::from_parameters(&req.parameters);
        let region = req
            .parameters
            .get("region")
            .cloned()
            .unwrap_or_else(|| self.default_region.clone());

        let mut volume_context = HashMap::new();
        volume_context.insert("region".to_owned(), region.clone());

        match mode {
            ProvisioningMode::Dedicated => {
                self.objects.create_bucket(volume_id.as_bucket_name(), &region).await?;
                volume_context.insert("bucketName".to_owned(), volume_id.as_str().to_owned());
            }
            ProvisioningMode::Shared { bucket_prefix } => {
                if !self.objects.bucket_exists(&bucket_prefix).await? {
                    return Err(DriverError::InvalidArgument(format!(
                        "bucketPrefix {bucket_prefix} does not reference an existing bucket"
                    )));
                }
                let prefix = format!("volumes/{}/", volume_id.as_str());
                volume_context.insert("bucketName".to_owned(), bucket_prefix);
                volume_context.insert("prefix".to_owned(), prefix);
            }
        }

        let volume = Volume {
            capacity_bytes: CAPACITY_SENTINEL_BYTES,
            volume_id: volume_id.as_str().to_owned(),
            volume_context,
        };
        let parameters: BTreeMap<String, String> = req.parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.volumes.record(&req.name, volume.clone(), &parameters).await?;
        Ok(volume)
    }

    #[instrument(skip_all, fields(volume_id = %req.volume_id))]
    async fn delete_volume_inner(&self, req: &DeleteVolumeRequest) -> DriverResult<()> {
        let volume_id = match VolumeId::parse_dynamic(&req.volume_id) {
            Ok(id) => id,
            Err(_) => return Ok(()), // unknown/malformed volumeID: success per CSI spec
        };

        if let Some(prefix) = self.volumes.shared_prefix_for(&req.volume_id).await? {
            let bucket = self
                .volumes
                .lookup_by_volume_id(&req.volume_id)
                .await?
                .and_then(|v| v.volume_context.get("bucketName").cloned());
            if let Some(bucket) = bucket {
                self.objects.delete_prefix(&bucket, &prefix).await?;
            }
            self.volumes.forget(&req.volume_id).await?;
            return Ok(());
        }

        let bucket = volume_id.as_bucket_name();
        if self.objects.bucket_exists(bucket).await? {
            if self.objects.bucket_is_empty(bucket).await? {
                self.objects.delete_bucket(bucket).await?;
            }
            // Non-empty: leak the bucket rather than destroy data (§7 documented policy).
        }
        self.volumes.forget(&req.volume_id).await?;
        Ok(())
    }
}

/// Whether `existing_bytes` (always [`CAPACITY_SENTINEL_BYTES`] for a volume this driver
/// created) falls within the requested range, per the CSI idempotency rule in §4.8/§7: a
/// repeated `CreateVolume` with a narrower range than what's on record must not silently succeed.
fn capacity_satisfied(existing_bytes: i64, requested: Option<&CapacityRange>) -> bool {
    match requested {
        None => true,
        Some(range) => {
            let required_ok = range.required_bytes == 0 || range.required_bytes <= existing_bytes;
            let limit_ok = range.limit_bytes == 0 || range.limit_bytes >= existing_bytes;
            required_ok && limit_ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProvisioningMode {
    Dedicated,
    Shared { bucket_prefix: String },
}

impl ProvisioningMode {
    fn from_parameters(parameters: &HashMap<String, String>) -> Self {
        match parameters.get("bucketPrefix") {
            Some(prefix) => ProvisioningMode::Shared {
                bucket_prefix: prefix.clone(),
            },
            None => ProvisioningMode::Dedicated,
        }
    }
}

#[async_trait]
impl Controller for ProvisioningService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        self.require_leader()?;
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let volume = self
            .create_volume_inner(&req)
            .await
            .map_err(|e| e.context("CreateVolume", &req.name))?;
        Ok(Response::new(CreateVolumeResponse { volume: Some(volume) }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        self.require_leader()?;
        let req = request.into_inner();
        self.delete_volume_inner(&req)
            .await
            .map_err(|e| e.context("DeleteVolume", &req.volume_id))?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let confirmed: Vec<VolumeCapability> = req
            .volume_capabilities
            .into_iter()
            .filter(|c| {
                c.access_mode
                    .as_ref()
                    .map(|m| m.mode == 5 /* MULTI_NODE_MULTI_WRITER */)
                    .unwrap_or(false)
            })
            .collect();

        if confirmed.is_empty() {
            return Ok(Response::new(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "only MULTI_NODE_MULTI_WRITER is supported".to_owned(),
            }));
        }
        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(
                csi_s3_proto::csi::validate_volume_capabilities_response::Confirmed {
                    volume_capabilities: confirmed,
                },
            ),
            message: String::new(),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability {
                r#type: Some(csi_s3_proto::csi::controller_service_capability::Type::Rpc(
                    csi_s3_proto::csi::controller_service_capability::Rpc {
                        r#type: csi_s3_proto::csi::controller_service_capability::rpc::Type::CreateDeleteVolume as i32,
                    },
                )),
            }],
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Ok(Response::new(GetCapacityResponse {
            available_capacity: CAPACITY_SENTINEL_BYTES,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dedicated_mode_is_the_default() {
        let params = HashMap::new();
        assert_eq!(ProvisioningMode::from_parameters(&params), ProvisioningMode::Dedicated);
    }

    #[test]
    fn bucket_prefix_param_selects_shared_mode() {
        let mut params = HashMap::new();
        params.insert("bucketPrefix".to_owned(), "shared-bucket".to_owned());
        assert_eq!(
            ProvisioningMode::from_parameters(&params),
            ProvisioningMode::Shared {
                bucket_prefix: "shared-bucket".to_owned()
            }
        );
    }

    #[test]
    fn no_requested_range_is_always_satisfied() {
        assert!(capacity_satisfied(CAPACITY_SENTINEL_BYTES, None));
    }

    #[test]
    fn zero_valued_bounds_are_treated_as_unset() {
        let range = CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        };
        assert!(capacity_satisfied(CAPACITY_SENTINEL_BYTES, Some(&range)));
    }

    #[test]
    fn a_limit_below_the_recorded_capacity_is_unsatisfied() {
        let range = CapacityRange {
            required_bytes: 0,
            limit_bytes: 1024,
        };
        assert!(!capacity_satisfied(CAPACITY_SENTINEL_BYTES, Some(&range)));
    }
}

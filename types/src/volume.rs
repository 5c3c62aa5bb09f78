use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DriverError, Result};

/// Fixed prefix every dynamically-provisioned volume ID (and bucket name) must carry (§4.8).
pub const DYNAMIC_VOLUME_PREFIX: &str = "csi-s3-";

/// A Volume Handle (§3): a flat string, unique per volume. For dynamic volumes this equals the
/// S3 bucket name, enforcing invariant 4 in §8.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(String);

impl VolumeId {
    /// Generate a fresh dynamic volume ID: `csi-s3-<uuid>`.
    pub fn generate() -> Self {
        Self(format!("{DYNAMIC_VOLUME_PREFIX}{}", Uuid::new_v4()))
    }

    /// Accept a caller-supplied (static) or previously-generated (dynamic) volume ID verbatim.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Parse a dynamically-provisioned volume ID, rejecting anything without the fixed prefix
    /// (§4.8 safety requirement: only ever operate on `csi-s3-` prefixed bucket names).
    pub fn parse_dynamic(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if !raw.starts_with(DYNAMIC_VOLUME_PREFIX) {
            return Err(DriverError::InvalidArgument(format!(
                "volume id {raw:?} does not start with the required prefix {DYNAMIC_VOLUME_PREFIX:?}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The dynamic volume ID equals its bucket name (§8 invariant 4).
    pub fn as_bucket_name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<VolumeId> for String {
    fn from(id: VolumeId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod test {
    use super::VolumeId;

    #[test]
    fn generated_ids_carry_the_prefix() {
        let id = VolumeId::generate();
        assert!(id.as_str().starts_with("csi-s3-"));
        assert_eq!(id.as_str(), id.as_bucket_name());
    }

    #[test]
    fn parse_dynamic_rejects_missing_prefix() {
        assert!(VolumeId::parse_dynamic("not-ours").is_err());
        assert!(VolumeId::parse_dynamic("csi-s3-abc").is_ok());
    }
}

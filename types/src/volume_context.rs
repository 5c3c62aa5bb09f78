use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Where a volume's credentials should be resolved from (§4.7). Parsed once at ingress from the
/// raw `volume_context` dictionary the orchestrator hands over; the dictionary itself is not
/// kept around (per the design notes on "dynamic dispatch on volume attributes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationSource {
    Secret,
    Driver,
    Profile,
    Instance,
}

impl std::str::FromStr for AuthenticationSource {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "secret" => Ok(Self::Secret),
            "driver" => Ok(Self::Driver),
            "profile" => Ok(Self::Profile),
            "instance" => Ok(Self::Instance),
            other => Err(DriverError::InvalidArgument(format!(
                "unknown authenticationSource {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for AuthenticationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Secret => "secret",
            Self::Driver => "driver",
            Self::Profile => "profile",
            Self::Instance => "instance",
        };
        write!(f, "{s}")
    }
}

/// Attributes attached to a volume (§3). Produced by the provisioning controller (C8) on
/// create, read by the node pipeline (C6) on publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeContext {
    pub bucket_name: String,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub authentication_source: Option<AuthenticationSource>,
}

impl VolumeContext {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("bucketName".to_owned(), self.bucket_name.clone());
        if let Some(prefix) = &self.prefix {
            map.insert("prefix".to_owned(), prefix.clone());
        }
        if let Some(region) = &self.region {
            map.insert("region".to_owned(), region.clone());
        }
        if let Some(source) = self.authentication_source {
            map.insert("authenticationSource".to_owned(), source.to_string());
        }
        map
    }
}

impl TryFrom<&HashMap<String, String>> for VolumeContext {
    type Error = DriverError;

    fn try_from(map: &HashMap<String, String>) -> Result<Self> {
        let bucket_name = map
            .get("bucketName")
            .ok_or_else(|| DriverError::InvalidArgument("volume_context missing bucketName".into()))?
            .clone();
        let authentication_source = map
            .get("authenticationSource")
            .map(|s| s.parse())
            .transpose()?;
        Ok(Self {
            bucket_name,
            prefix: map.get("prefix").cloned(),
            region: map.get("region").cloned(),
            authentication_source,
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::{AuthenticationSource, VolumeContext};

    #[test]
    fn round_trips_through_map() {
        let ctx = VolumeContext {
            bucket_name: "csi-s3-abc".into(),
            prefix: Some("volumes/csi-s3-abc/".into()),
            region: Some("us-east-1".into()),
            authentication_source: Some(AuthenticationSource::Secret),
        };
        let map = ctx.to_map();
        let parsed = VolumeContext::try_from(&map).unwrap();
        assert_eq!(ctx, parsed);
    }

    #[test]
    fn rejects_missing_bucket_name() {
        let map = HashMap::new();
        assert!(VolumeContext::try_from(&map).is_err());
    }
}

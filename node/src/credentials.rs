use std::collections::HashMap;

use csi_s3_types::error::Result;
use csi_s3_types::volume_context::AuthenticationSource;
use csi_s3_types::{CredentialBundle, DriverError};
use tera::{Context as TeraContext, Tera};
use tracing::debug;

use crate::config::Config;

/// Resolves effective S3 credentials in the strict order required by §4.7, stopping at the
/// first source that yields a usable bundle. Levels 2-4 are identical between publish and
/// provisioning flows; only level 1's secret map differs by caller.
pub struct CredentialResolver<'a> {
    cfg: &'a Config,
    secrets_api: kube::Api<k8s_openapi::api::core::v1::Secret>,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(cfg: &'a Config, client: kube::Client) -> Self {
        let secrets_api = kube::Api::namespaced(client, &cfg.driver_namespace);
        Self { cfg, secrets_api }
    }

    /// Resolves credentials for one publish call. `requested` is the `authenticationSource`
    /// declared on the volume context, if any; `per_mount_secrets` is the request's `secrets` map
    /// (CSI's per-publish secret channel, already handed to us in plaintext by the orchestrator).
    pub async fn resolve(
        &self,
        requested: Option<AuthenticationSource>,
        per_mount_secrets: &HashMap<String, String>,
    ) -> Result<CredentialBundle> {
        if matches!(requested, Some(AuthenticationSource::Secret) | None) {
            if let Some(bundle) = Self::from_secret_map(per_mount_secrets) {
                debug!("resolved credentials from per-mount secret");
                return Ok(bundle);
            }
        }

        if let Some(bundle) = self.from_driver_default().await? {
            debug!("resolved credentials from per-driver default secret");
            return Ok(bundle);
        }

        if let Some(bundle) = self.from_profile_file().await? {
            debug!("resolved credentials from profile file");
            return Ok(bundle);
        }

        debug!("falling back to ambient instance identity");
        Ok(CredentialBundle {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: None,
            region: None,
            endpoint: None,
            ca_bundle: None,
        })
    }

    fn from_secret_map(map: &HashMap<String, String>) -> Option<CredentialBundle> {
        let access_key_id = map.get("accessKeyId")?.clone();
        let secret_access_key = map.get("secretAccessKey")?.clone();
        Some(CredentialBundle {
            access_key_id,
            secret_access_key,
            session_token: map.get("sessionToken").cloned(),
            region: map.get("region").cloned(),
            endpoint: map.get("endpoint").cloned(),
            ca_bundle: None,
        })
    }

    async fn from_driver_default(&self) -> Result<Option<CredentialBundle>> {
        let name = render_secret_name(&self.cfg.default_secret_name_template, &self.cfg.driver_namespace)?;
        match self.secrets_api.get_opt(&name).await.map_err(DriverError::from)? {
            Some(secret) => Ok(secret_to_bundle(&secret)),
            None => Ok(None),
        }
    }

    async fn from_profile_file(&self) -> Result<Option<CredentialBundle>> {
        let path = &self.cfg.profile_credentials_path;
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DriverError::Internal(format!("reading profile file {path}: {e}"))),
        };
        Ok(parse_profile_ini(&raw))
    }
}

fn render_secret_name(template: &str, driver_namespace: &str) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("secret-name", template)
        .map_err(|e| DriverError::Internal(format!("invalid secret name template: {e}")))?;
    let mut ctx = TeraContext::new();
    ctx.insert("driver_namespace", driver_namespace);
    tera.render("secret-name", &ctx)
        .map_err(|e| DriverError::Internal(format!("rendering secret name template: {e}")))
}

fn secret_to_bundle(secret: &k8s_openapi::api::core::v1::Secret) -> Option<CredentialBundle> {
    let data = secret.data.as_ref()?;
    let get = |key: &str| data.get(key).map(|v| String::from_utf8_lossy(&v.0).into_owned());
    Some(CredentialBundle {
        access_key_id: get("accessKeyId")?,
        secret_access_key: get("secretAccessKey")?,
        session_token: get("sessionToken"),
        region: get("region"),
        endpoint: get("endpoint"),
        ca_bundle: data.get("caBundle").map(|v| v.0.clone()),
    })
}

/// Parses a minimal `[default]`-style ini credentials file. Only the keys the driver cares
/// about are recognised; anything else is ignored.
fn parse_profile_ini(raw: &str) -> Option<CredentialBundle> {
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;
    let mut region = None;

    for line in raw.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_owned();
        match key.trim() {
            "aws_access_key_id" => access_key_id = Some(value),
            "aws_secret_access_key" => secret_access_key = Some(value),
            "aws_session_token" => session_token = Some(value),
            "region" => region = Some(value),
            _ => {}
        }
    }

    Some(CredentialBundle {
        access_key_id: access_key_id?,
        secret_access_key: secret_access_key?,
        session_token,
        region,
        endpoint: None,
        ca_bundle: None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_map_requires_both_keys() {
        let mut map = HashMap::new();
        map.insert("accessKeyId".to_owned(), "AKIA".to_owned());
        assert!(CredentialResolver::from_secret_map(&map).is_none());
        map.insert("secretAccessKey".to_owned(), "shh".to_owned());
        assert!(CredentialResolver::from_secret_map(&map).is_some());
    }

    #[test]
    fn renders_the_default_template() {
        let name = render_secret_name("{{ driver_namespace }}-s3-credentials", "kube-system").unwrap();
        assert_eq!(name, "kube-system-s3-credentials");
    }

    #[test]
    fn parses_a_minimal_profile_file() {
        let raw = "[default]\naws_access_key_id = AKIA\naws_secret_access_key = shh\nregion=us-west-2\n";
        let bundle = parse_profile_ini(raw).unwrap();
        assert_eq!(bundle.access_key_id, "AKIA");
        assert_eq!(bundle.region.as_deref(), Some("us-west-2"));
    }

    #[test]
    fn missing_profile_keys_yield_none() {
        assert!(parse_profile_ini("[default]\nregion=us-west-2\n").is_none());
    }
}

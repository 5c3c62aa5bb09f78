/// Effective S3 credentials resolved for one mount (§3). Ephemeral: never persisted beyond the
/// mounter pod's runtime, and never logged — the hand-rolled `Debug` impl below redacts every
/// secret-shaped field, so an accidental `{:?}` in a log line cannot leak material.
#[derive(Clone)]
pub struct CredentialBundle {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub ca_bundle: Option<Vec<u8>>,
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("ca_bundle", &self.ca_bundle.as_ref().map(|b| format!("<{} bytes>", b.len())))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::CredentialBundle;

    #[test]
    fn debug_never_prints_secret_material() {
        let bundle = CredentialBundle {
            access_key_id: "AKIASECRET".into(),
            secret_access_key: "supersecretvalue".into(),
            session_token: Some("tokensecret".into()),
            region: Some("us-east-1".into()),
            endpoint: None,
            ca_bundle: None,
        };
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains("AKIASECRET"));
        assert!(!rendered.contains("supersecretvalue"));
        assert!(!rendered.contains("tokensecret"));
    }
}

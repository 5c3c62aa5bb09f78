use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The single frame sent once per mounter-pod lifetime over the Mount-Option Transport (C2,
/// §4.2). `argv`/`envp` drive the FUSE exec; `credential_files` are side-files (e.g. a CA
/// bundle) the mounter agent writes to its tmpfs before exec; nothing here is ever logged
/// verbatim by the sender or receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionsFrame {
    pub argv: Vec<String>,
    pub envp: HashMap<String, String>,
    pub credential_files: HashMap<String, Vec<u8>>,
    /// Empty if unset.
    pub fs_group: String,
    pub bucket_name: String,
    /// Path inside the mounter pod's filesystem the FUSE process should mount onto.
    pub source_path: String,
}

impl std::fmt::Debug for RedactedFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionsFrame")
            .field("argv", &self.0.argv)
            .field("envp", &"<redacted>")
            .field("credential_files", &format!("<{} files redacted>", self.0.credential_files.len()))
            .field("fs_group", &self.0.fs_group)
            .field("bucket_name", &self.0.bucket_name)
            .field("source_path", &self.0.source_path)
            .finish()
    }
}

/// Wrap an [`OptionsFrame`] for logging: the `argv`/envp/credential bytes are exactly the
/// material §7 forbids logging verbatim, so this is the only `Debug` path production code should
/// use for a frame.
pub struct RedactedFrame<'a>(pub &'a OptionsFrame);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redacted_debug_never_prints_envp_values() {
        let mut envp = HashMap::new();
        envp.insert("AWS_SECRET_ACCESS_KEY".to_owned(), "super-secret".to_owned());
        let frame = OptionsFrame {
            argv: vec!["mount-s3".to_owned()],
            envp,
            credential_files: HashMap::new(),
            fs_group: String::new(),
            bucket_name: "my-bucket".to_owned(),
            source_path: "/mnt/source".to_owned(),
        };
        let debug = format!("{:?}", RedactedFrame(&frame));
        assert!(!debug.contains("super-secret"));
    }
}

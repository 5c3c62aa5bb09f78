use sha2::{Digest, Sha224};

use crate::fingerprint::Fingerprint;

/// Deterministically names a mounter pod from `(workloadUID, pvName)` (§4.5). Any component can
/// compute the expected name independently, which is what lets the Node Mount Pipeline (C6)
/// poll for a pod it did not create without a TOCTOU race.
///
/// SHA-224 is used because it produces exactly 56 hex characters, matching the width named in
/// §4.5 ("e.g. 56 hex chars") with no truncation needed.
pub fn mounter_pod_name(workload_uid: &str, pv_name: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(workload_uid.as_bytes());
    hasher.update(pv_name.as_bytes());
    let digest = hasher.finalize();
    format!("mp-{}", hex_encode(&digest))
}

/// Deterministically names an Attachment Record from the full fingerprint tuple. A record
/// carries exactly one fingerprint (§3), so every field that distinguishes two fingerprints
/// must feed this name, not just `(volume_id, node_name)` — two workloads with the same volume
/// and node but a different `workload_fs_group` (or any other fingerprint field) must land on
/// distinct records rather than collide and fight over the same one.
pub fn attachment_record_name(fingerprint: &Fingerprint) -> String {
    let mut hasher = Sha224::new();
    hasher.update(fingerprint.node_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.persistent_volume_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.volume_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.mount_options.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.workload_fs_group.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.authentication_source.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.workload_namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.workload_service_account.as_bytes());
    let digest = hasher.finalize();
    format!("att-{}", hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod test {
    use super::{attachment_record_name, mounter_pod_name};
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
    fn attachment_record_name_differs_on_fs_group_alone() {
        let a = attachment_record_name(&fp());
        let b = attachment_record_name(&Fingerprint {
            workload_fs_group: "1000".into(),
            ..fp()
        });
        assert_ne!(a, b);
    }

    #[test]
    fn attachment_record_name_is_deterministic() {
        let a = attachment_record_name(&fp());
        let b = attachment_record_name(&fp());
        assert_eq!(a, b);
    }

    #[test]
    fn is_deterministic() {
        let a = mounter_pod_name("uid-1", "pv-1");
        let b = mounter_pod_name("uid-1", "pv-1");
        assert_eq!(a, b);
    }

    #[test]
    fn differs_on_either_input() {
        let a = mounter_pod_name("uid-1", "pv-1");
        let b = mounter_pod_name("uid-2", "pv-1");
        let c = mounter_pod_name("uid-1", "pv-2");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn has_fixed_width_hex_suffix() {
        let name = mounter_pod_name("uid", "pv");
        let hex = name.strip_prefix("mp-").expect("mp- prefix");
        assert_eq!(hex.len(), 56);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

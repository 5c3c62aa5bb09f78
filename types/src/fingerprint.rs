use serde::{Deserialize, Serialize};

/// The tuple of attributes that determines whether two workloads can share a mounter pod
/// (§3). Every field is independently indexable on the Attachment Record — it is never hashed
/// away, per the invariant in §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub node_name: String,
    pub persistent_volume_name: String,
    pub volume_id: String,
    /// Canonicalised (sorted, comma-joined) mount options.
    pub mount_options: String,
    /// Empty string if unset.
    pub workload_fs_group: String,
    pub authentication_source: String,
    pub workload_namespace: String,
    pub workload_service_account: String,
}

impl Fingerprint {
    /// Canonicalise a raw option list: dedup, sort, comma-join. Two workloads with the same
    /// options in a different order must compare equal.
    pub fn canonicalise_mount_options<I, S>(options: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut opts: Vec<String> = options.into_iter().map(Into::into).collect();
        opts.sort();
        opts.dedup();
        opts.join(",")
    }

    /// A unique key suitable for matching against another fingerprint's field set, e.g. in an
    /// in-process index keyed by the full tuple.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        self == other
    }
}

#[cfg(test)]
mod test {
    use super::Fingerprint;

    #[test]
    fn canonicalise_is_order_independent() {
        let a = Fingerprint::canonicalise_mount_options(["b", "a", "c"]);
        let b = Fingerprint::canonicalise_mount_options(["c", "b", "a"]);
        assert_eq!(a, b);
        assert_eq!(a, "a,b,c");
    }

    #[test]
    fn canonicalise_dedups() {
        let a = Fingerprint::canonicalise_mount_options(["a", "a", "b"]);
        assert_eq!(a, "a,b");
    }
}

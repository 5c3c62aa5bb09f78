use std::collections::BTreeMap;

use csi_s3_types::Fingerprint;
use csi_s3_utils::consts::{
    ANNOTATION_FINGERPRINT_HASH, ANNOTATION_NEEDS_UNMOUNT, ANNOTATION_NO_NEW_WORKLOAD,
    DRIVER_VERSION_LABEL, SOURCE_MOUNT_SUBDIR,
};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, HostPathVolumeSource, Pod, PodSpec, ResourceRequirements,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Static build parameters for mounter pods, sourced from [`crate::config::Config`] (§4.3).
#[derive(Debug, Clone)]
pub struct PodBuilderConfig {
    pub namespace: String,
    pub image: String,
    pub priority_class: String,
    pub driver_version: String,
    pub plugin_root_dir: String,
    pub cache_memory_multiplier: f64,
    /// Local-disk cache size in bytes, if the mount options requested one.
    pub cache_size_bytes: Option<u64>,
}

const SOCKET_VOLUME_NAME: &str = "mount-options-socket";
const SOURCE_VOLUME_NAME: &str = "source-mount";
const CACHE_VOLUME_NAME: &str = "mountpoint-cache";

/// Produces a declarative mounter pod spec for a fingerprint (C3, §4.3). Pure: no I/O, no
/// cluster access — this is exactly the shape of the teacher's `ClusterController::apply_*`
/// helpers, minus the `Patch::Apply` call, since the caller (the reconciler) owns the write.
pub fn build_mounter_pod(pod_name: &str, fingerprint: &Fingerprint, cfg: &PodBuilderConfig) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_owned(), "s3-csi-mounter".to_owned());
    labels.insert(DRIVER_VERSION_LABEL.to_owned(), cfg.driver_version.clone());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_FINGERPRINT_HASH.to_owned(),
        fingerprint_hash_annotation(fingerprint),
    );
    // Reserved slots: left unset at creation time; the reconciler sets them later via patch
    // when draining (§3).
    annotations.insert(ANNOTATION_NEEDS_UNMOUNT.to_owned(), "false".to_owned());
    annotations.insert(ANNOTATION_NO_NEW_WORKLOAD.to_owned(), "false".to_owned());

    let source_host_path = format!("{}/{SOURCE_MOUNT_SUBDIR}/{pod_name}", cfg.plugin_root_dir);

    let mut volumes = vec![
        Volume {
            name: SOCKET_VOLUME_NAME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_owned()),
                ..EmptyDirVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: SOURCE_VOLUME_NAME.to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: source_host_path,
                type_: Some("DirectoryOrCreate".to_owned()),
            }),
            ..Volume::default()
        },
    ];

    let mut volume_mounts = vec![
        VolumeMount {
            name: SOCKET_VOLUME_NAME.to_owned(),
            mount_path: "/tmp".to_owned(),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: SOURCE_VOLUME_NAME.to_owned(),
            mount_path: "/mnt/source".to_owned(),
            // Bidirectional so bind mounts created by the node pipeline (C6) in the host
            // mount namespace become visible inside this pod's namespace and vice versa (§4.3).
            mount_propagation: Some("Bidirectional".to_owned()),
            ..VolumeMount::default()
        },
    ];

    if let Some(cache_bytes) = cfg.cache_size_bytes {
        volumes.push(Volume {
            name: CACHE_VOLUME_NAME.to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: format!("{}/cache/{pod_name}", cfg.plugin_root_dir),
                type_: Some("DirectoryOrCreate".to_owned()),
            }),
            ..Volume::default()
        });
        volume_mounts.push(VolumeMount {
            name: CACHE_VOLUME_NAME.to_owned(),
            mount_path: "/mnt/cache".to_owned(),
            ..VolumeMount::default()
        });
        let _ = cache_bytes;
    }

    let resources = compute_resources(cfg);

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_owned()),
            namespace: Some(cfg.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some(fingerprint.node_name.clone()),
            restart_policy: Some("Never".to_owned()),
            priority_class_name: Some(cfg.priority_class.clone()),
            containers: vec![Container {
                name: "s3-mounter".to_owned(),
                image: Some(cfg.image.clone()),
                resources: Some(resources),
                volume_mounts: Some(volume_mounts),
                ..Container::default()
            }],
            volumes: Some(volumes),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// Resource requests/limits computed from mount options (§4.3). The exact multiplier is an
/// undocumented tunable per §9; this applies `cache_memory_multiplier` to the declared cache
/// size for memory, with a flat, cache-size-independent CPU request.
fn compute_resources(cfg: &PodBuilderConfig) -> ResourceRequirements {
    let memory_bytes = cfg
        .cache_size_bytes
        .map_or(64 * 1024 * 1024, |cache| (cache as f64 * cfg.cache_memory_multiplier) as u64 + 64 * 1024 * 1024);

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_owned(), Quantity("100m".to_owned()));
    requests.insert("memory".to_owned(), Quantity(format!("{memory_bytes}")));

    ResourceRequirements {
        requests: Some(requests),
        limits: None,
        ..ResourceRequirements::default()
    }
}

fn fingerprint_hash_annotation(fingerprint: &Fingerprint) -> String {
    // Debugging aid only (§4.3); not used for identity or lookups.
    format!(
        "{}/{}/{}",
        fingerprint.node_name, fingerprint.persistent_volume_name, fingerprint.volume_id
    )
}

#[cfg(test)]
mod test {
    use super::*;

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

    fn cfg() -> PodBuilderConfig {
        PodBuilderConfig {
            namespace: "kube-system".into(),
            image: "s3-mounter:latest".into(),
            priority_class: "system-node-critical".into(),
            driver_version: "1.2.3".into(),
            plugin_root_dir: "/var/lib/kubelet/plugins/s3.csi.aws.com".into(),
            cache_memory_multiplier: 0.1,
            cache_size_bytes: None,
        }
    }

    #[test]
    fn pins_to_the_workload_node() {
        let pod = build_mounter_pod("mp-abc", &fp(), &cfg());
        assert_eq!(pod.spec.unwrap().node_name.as_deref(), Some("node-1"));
    }

    #[test]
    fn never_restarts() {
        let pod = build_mounter_pod("mp-abc", &fp(), &cfg());
        assert_eq!(pod.spec.unwrap().restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn stamps_the_driver_version_label() {
        let pod = build_mounter_pod("mp-abc", &fp(), &cfg());
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(DRIVER_VERSION_LABEL), Some(&"1.2.3".to_owned()));
    }

    #[test]
    fn cache_size_increases_memory_request() {
        let mut with_cache = cfg();
        with_cache.cache_size_bytes = Some(10 * 1024 * 1024 * 1024);
        let pod_no_cache = build_mounter_pod("mp-abc", &fp(), &cfg());
        let pod_with_cache = build_mounter_pod("mp-abc", &fp(), &with_cache);

        let mem = |pod: &Pod| -> i64 {
            pod.spec
                .as_ref()
                .unwrap()
                .containers[0]
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()
                .get("memory")
                .unwrap()
                .0
                .parse()
                .unwrap()
        };
        assert!(mem(&pod_with_cache) > mem(&pod_no_cache));
    }
}

//! Role pod construction
//!
//! Both pods are controlled by the target claim and carry the clone
//! unique-id label the reconciler finds them by.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod,
    PodAffinity, PodAffinityTerm, PodSecurityContext, PodSpec, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::annotations::{
    clone_unique_id, PodRole, LABEL_CLONE_UNIQUE_ID, LABEL_COMPONENT, LABEL_OWNER_KEY,
    LABEL_OWNER_VALUE, LABEL_TARGET_POD_NAMESPACE,
};
use crate::compat::volume_mode;
use crate::error::{Error, Result};

pub const CLONER_SOURCE_POD_NAME: &str = "cdi-clone-source";
pub const CLONER_TARGET_POD_NAME: &str = "cdi-clone-target";
const DATA_VOLUME_NAME: &str = "cdi-data-vol";
const CLONER_MOUNT_PATH: &str = "/tmp/clone/image";
const BLOCK_DEVICE_PATH: &str = "/dev/cdi-block-volume";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Container settings shared by both role pods
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClonePodSettings {
    pub image: String,
    pub pull_policy: String,
    pub verbose: u8,
}

/// Pod exporting `source`'s data, placed in the source namespace
pub fn source_pod(
    settings: &ClonePodSettings,
    target: &PersistentVolumeClaim,
    source: &PersistentVolumeClaim,
) -> Result<Pod> {
    let namespace = source
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace of source claim".into()))?;
    let mut pod = role_pod(
        settings,
        PodRole::Source,
        target,
        &namespace,
        &source.name_any(),
        block_mode(source),
    )?;
    if let Some(spec) = pod.spec.as_mut() {
        spec.security_context = Some(PodSecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        });
    }
    Ok(pod)
}

/// Pod importing into `target`, scheduled next to the source pod
pub fn target_pod(
    settings: &ClonePodSettings,
    target: &PersistentVolumeClaim,
    source_pod_namespace: &str,
) -> Result<Pod> {
    let namespace = target
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace of target claim".into()))?;
    let uid = claim_uid(target)?;
    let mut pod = role_pod(
        settings,
        PodRole::Target,
        target,
        &namespace,
        &target.name_any(),
        block_mode(target),
    )?;
    if let Some(spec) = pod.spec.as_mut() {
        spec.affinity = Some(Affinity {
            pod_affinity: Some(PodAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            LABEL_CLONE_UNIQUE_ID.to_string(),
                            clone_unique_id(&uid, PodRole::Source),
                        )])),
                        ..Default::default()
                    }),
                    namespaces: Some(vec![source_pod_namespace.to_string()]),
                    topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    Ok(pod)
}

fn role_pod(
    settings: &ClonePodSettings,
    role: PodRole,
    target: &PersistentVolumeClaim,
    namespace: &str,
    claim_name: &str,
    block: bool,
) -> Result<Pod> {
    let uid = claim_uid(target)?;
    let target_namespace = target
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace of target claim".into()))?;
    let component = match role {
        PodRole::Source => CLONER_SOURCE_POD_NAME,
        PodRole::Target => CLONER_TARGET_POD_NAME,
    };

    let labels = BTreeMap::from([
        (LABEL_OWNER_KEY.to_string(), LABEL_OWNER_VALUE.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_CLONE_UNIQUE_ID.to_string(), clone_unique_id(&uid, role)),
        (LABEL_TARGET_POD_NAMESPACE.to_string(), target_namespace),
    ]);

    let mut container = Container {
        name: component.to_string(),
        image: Some(settings.image.clone()),
        image_pull_policy: Some(settings.pull_policy.clone()),
        args: Some(vec![format!("-v={}", settings.verbose), role.as_str().to_string()]),
        ..Default::default()
    };
    if block {
        container.volume_devices = Some(vec![VolumeDevice {
            name: DATA_VOLUME_NAME.to_string(),
            device_path: BLOCK_DEVICE_PATH.to_string(),
        }]);
    } else {
        container.volume_mounts = Some(vec![VolumeMount {
            name: DATA_VOLUME_NAME.to_string(),
            mount_path: CLONER_MOUNT_PATH.to_string(),
            ..Default::default()
        }]);
    }

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", component)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![claim_owner_reference(target, &uid)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("OnFailure".to_string()),
            volumes: Some(vec![Volume {
                name: DATA_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.to_string(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

fn claim_uid(claim: &PersistentVolumeClaim) -> Result<String> {
    claim
        .uid()
        .ok_or_else(|| Error::MissingField(format!("uid of claim {}", claim.name_any())))
}

fn claim_owner_reference(claim: &PersistentVolumeClaim, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "PersistentVolumeClaim".to_string(),
        name: claim.name_any(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn block_mode(claim: &PersistentVolumeClaim) -> bool {
    claim
        .spec
        .as_ref()
        .is_some_and(|spec| volume_mode(spec) == "Block")
}

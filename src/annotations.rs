//! Annotation and label vocabulary shared with the rest of the storage stack
//!
//! The target claim's annotations are the only durable record of clone
//! progress, so every key in here is part of the wire contract.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::error::{Error, Result};

/// Marks a claim as a clone target; value is `sourceNamespace/sourceName`
pub const ANN_CLONE_REQUEST: &str = "k8s.io/CloneRequest";
/// Set to `"true"` once cloning has completed
pub const ANN_CLONE_OF: &str = "k8s.io/CloneOf";
/// Signed clone authorization token
pub const ANN_CLONE_TOKEN: &str = "cdi.kubevirt.io/storage.clone.token";
/// Last observed phase of the pod driving the claim's population
pub const ANN_POD_PHASE: &str = "cdi.kubevirt.io/storage.pod.phase";

/// Label selecting the role pods of a clone (the key's spelling is load-bearing)
pub const LABEL_CLONE_UNIQUE_ID: &str = "cdi.kubevirt.io/storage.clone.cloneUniqeId";
/// Label recording the target claim's namespace on clone pods
pub const LABEL_TARGET_POD_NAMESPACE: &str = "cdi.kubevirt.io/storage.clone.targetPod.namespace";
/// Component label carried by role pods
pub const LABEL_COMPONENT: &str = "cdi.kubevirt.io";

/// Ownership label shared by the storage controllers
pub const LABEL_OWNER_KEY: &str = "app";
/// Ownership label value
pub const LABEL_OWNER_VALUE: &str = "containerized-data-importer";

/// Pod phase reported once the clone finished
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";

/// `namespace/name` identity of a namespaced object.
///
/// This is the reconciliation key: the unit of work dispatch and of
/// expectation tracking.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a claim as delivered by the watch
    pub fn of_claim(claim: &PersistentVolumeClaim) -> Result<Self> {
        let namespace = claim
            .namespace()
            .ok_or_else(|| Error::MissingField(format!("namespace of claim {}", claim.name_any())))?;
        Ok(Self::new(namespace, claim.name_any()))
    }

    /// Parse a `namespace/name` string. Both halves must be non-empty.
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }

    pub fn to_object_ref<K>(&self) -> ObjectRef<K>
    where
        K: kube::Resource<DynamicType = ()>,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The two sides of a clone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PodRole {
    /// Exports the source claim's data
    Source,
    /// Imports into the target claim
    Target,
}

impl PodRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodRole::Source => "source",
            PodRole::Target => "target",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            PodRole::Source => "-source-pod",
            PodRole::Target => "-target-pod",
        }
    }
}

impl fmt::Display for PodRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality selector on a single label
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSelector {
    pub key: &'static str,
    pub value: String,
}

impl PodSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(self.key).is_some_and(|v| *v == self.value)
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Unique id label value for a claim's role pod
pub fn clone_unique_id(claim_uid: &str, role: PodRole) -> String {
    format!("{}{}", claim_uid, role.suffix())
}

/// Selector locating the role pod of the claim with uid `claim_uid`
pub fn role_pod_selector(claim_uid: &str, role: PodRole) -> PodSelector {
    PodSelector {
        key: LABEL_CLONE_UNIQUE_ID,
        value: clone_unique_id(claim_uid, role),
    }
}

/// Raw clone-request value, if the claim carries one
pub fn clone_request(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .metadata
        .annotations
        .as_ref()?
        .get(ANN_CLONE_REQUEST)
        .map(String::as_str)
}

/// Source claim referenced by the clone request
pub fn clone_source(claim: &PersistentVolumeClaim) -> Result<ObjectKey> {
    let value = clone_request(claim).unwrap_or_default();
    ObjectKey::parse(value).ok_or_else(|| Error::MalformedCloneRequest(value.to_string()))
}

pub fn has_annotation(claim: &PersistentVolumeClaim, key: &str) -> bool {
    claim.annotations().contains_key(key)
}

pub fn has_label(claim: &PersistentVolumeClaim, key: &str, value: &str) -> bool {
    claim.labels().get(key).is_some_and(|v| v == value)
}

/// Whether a previous pass already mirrored a succeeded pod phase
pub fn phase_succeeded(claim: &PersistentVolumeClaim) -> bool {
    claim
        .annotations()
        .get(ANN_POD_PHASE)
        .is_some_and(|phase| phase == POD_PHASE_SUCCEEDED)
}

/// Reconciliation key of the claim that controls a clone pod.
///
/// Source pods live in the source namespace, so the claim's namespace comes
/// from the target-namespace label when present.
pub fn owning_claim_key(pod: &Pod) -> Option<ObjectKey> {
    let owner = pod
        .owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == "PersistentVolumeClaim")?;
    let namespace = pod
        .labels()
        .get(LABEL_TARGET_POD_NAMESPACE)
        .cloned()
        .or_else(|| pod.namespace())?;
    Some(ObjectKey::new(namespace, owner.name.clone()))
}

/// Whether `pod` is controlled by `claim`
pub fn is_controlled_by(pod: &Pod, claim: &PersistentVolumeClaim) -> bool {
    let Some(uid) = claim.uid() else {
        return false;
    };
    pod.owner_references()
        .iter()
        .any(|o| o.controller == Some(true) && o.uid == uid)
}

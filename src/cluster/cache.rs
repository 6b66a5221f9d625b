//! Read-only view of claims and clone pods kept current by watches

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::reflector::Store;
use kube::ResourceExt;

use crate::annotations::{ObjectKey, PodSelector};

/// Lookups the reconciler performs against the local object cache
pub trait ObjectCache: Send + Sync {
    /// Claim stored under `key`, if the cache has seen it
    fn get_claim(&self, key: &ObjectKey) -> Option<Arc<PersistentVolumeClaim>>;

    /// Pods in `namespace` whose labels satisfy `selector`
    fn list_pods(&self, namespace: &str, selector: &PodSelector) -> Vec<Arc<Pod>>;
}

/// Cache backed by kube-runtime reflector stores
#[derive(Clone)]
pub struct ReflectorCache {
    claims: Store<PersistentVolumeClaim>,
    pods: Store<Pod>,
}

impl ReflectorCache {
    pub fn new(claims: Store<PersistentVolumeClaim>, pods: Store<Pod>) -> Self {
        Self { claims, pods }
    }
}

impl ObjectCache for ReflectorCache {
    fn get_claim(&self, key: &ObjectKey) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims.get(&key.to_object_ref())
    }

    fn list_pods(&self, namespace: &str, selector: &PodSelector) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| selector.matches(pod.labels()))
            .collect()
    }
}

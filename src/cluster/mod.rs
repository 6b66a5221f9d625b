//! Boundary to the cluster: API client, object cache, events, and the
//! role-pod builders used by the workload lifecycle helpers.

mod cache;
mod events;
mod pods;

pub use cache::*;
pub use events::*;
pub use pods::*;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Attempts at a claim read-modify-write before a conflict is surfaced
const UPDATE_CONFLICT_ATTEMPTS: usize = 5;

/// Trait abstracting the Kubernetes API calls the clone reconciler makes
///
/// This allows mocking the client in tests while using the real client in
/// production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a StorageClass by name
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;

    /// Create a pod in the namespace named by its metadata
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod; a pod that is already gone is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge `annotations` and `labels` into the live claim
    ///
    /// Update conflicts are retried against a fresh read of the claim.
    async fn update_claim(
        &self,
        claim: &PersistentVolumeClaim,
        annotations: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let namespace = pod
            .namespace()
            .ok_or_else(|| Error::MissingField("namespace of pod to create".into()))?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, pod = name, "Pod already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_claim(
        &self,
        claim: &PersistentVolumeClaim,
        annotations: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim> {
        let namespace = claim
            .namespace()
            .ok_or_else(|| Error::MissingField("namespace of claim to update".into()))?;
        let name = claim.name_any();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);

        let mut current = claim.clone();
        let mut attempt = 1;
        loop {
            merge_metadata(&mut current, annotations, labels);
            match api.replace(&name, &PostParams::default(), &current).await {
                Ok(updated) => return Ok(updated),
                Err(kube::Error::Api(e)) if e.code == 409 && attempt < UPDATE_CONFLICT_ATTEMPTS => {
                    warn!(claim = %name, namespace = %namespace, attempt, "Claim update conflict, retrying");
                    attempt += 1;
                    current = api.get(&name).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Merge the given annotations and labels into the claim's metadata
pub fn merge_metadata(
    claim: &mut PersistentVolumeClaim,
    annotations: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) {
    claim
        .annotations_mut()
        .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    claim
        .labels_mut()
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn merge_keeps_existing_metadata() {
        let mut claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("target".into()),
                annotations: Some(BTreeMap::from([("keep".to_string(), "me".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };

        merge_metadata(
            &mut claim,
            &BTreeMap::from([("k8s.io/CloneOf".to_string(), "true".to_string())]),
            &BTreeMap::from([("app".to_string(), "containerized-data-importer".to_string())]),
        );

        assert_eq!(claim.annotations()["keep"], "me");
        assert_eq!(claim.annotations()["k8s.io/CloneOf"], "true");
        assert_eq!(claim.labels()["app"], "containerized-data-importer");
    }
}

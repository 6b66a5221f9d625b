//! Clone reconciler
//!
//! Drives a target claim carrying a clone request through its lifecycle:
//! - gate on binding state
//! - authorize the clone and check compatibility
//! - create the source pod, then the target pod
//! - mirror the target pod's phase and finalize once it succeeds
//!
//! The claim's annotations are the only persisted state. On every pass the
//! reconciler derives a [`CloneState`] from the claim and the cache, then
//! acts on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::annotations::{
    clone_request, clone_source, has_annotation, has_label, is_controlled_by, phase_succeeded,
    role_pod_selector, ObjectKey, PodRole, ANN_CLONE_OF, ANN_CLONE_TOKEN, ANN_POD_PHASE,
    LABEL_OWNER_KEY, LABEL_OWNER_VALUE,
};
use crate::cluster::{
    self, ClonePodSettings, EventPublisher, EventType, KubeClient, ObjectCache,
    ACTION_VALIDATE_CLONE, ERR_INCOMPATIBLE_PVC,
};
use crate::compat::CompatibilityChecker;
use crate::controllers::KeyedReconciler;
use crate::error::{Error, Result};
use crate::expectations::PodExpectations;
use crate::metrics;
use crate::token::{CloneTokenValidator, Operation, TokenError};

const CLAIM_BOUND: &str = "Bound";
const CLAIM_PENDING: &str = "Pending";
const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Where a clone stands, computed from observable facts on each pass
#[derive(Clone, Debug)]
pub enum CloneState {
    /// No clone request on the claim
    Unrequested,
    /// Claim not bound yet and its storage class does not wait for a consumer
    Deferred,
    /// Completion marker present
    Completed,
    /// Creations in flight but not yet in the cache, or the target pod
    /// already reported success on an earlier pass
    Settling,
    /// At least one role pod is missing
    AwaitingPods {
        source: Option<Arc<Pod>>,
        target: Option<Arc<Pod>>,
    },
    /// Both role pods exist; waiting for the target pod to succeed
    AwaitingCompletion { source: Arc<Pod>, target: Arc<Pod> },
}

impl CloneState {
    pub fn name(&self) -> &'static str {
        match self {
            CloneState::Unrequested => "Unrequested",
            CloneState::Deferred => "Deferred",
            CloneState::Completed => "Completed",
            CloneState::Settling => "Settling",
            CloneState::AwaitingPods { .. } => "AwaitingPods",
            CloneState::AwaitingCompletion { .. } => "AwaitingCompletion",
        }
    }
}

/// Reconciles clone-target claims
pub struct CloneReconciler {
    cache: Arc<dyn ObjectCache>,
    client: Arc<dyn KubeClient>,
    events: Arc<dyn EventPublisher>,
    compatibility: Arc<dyn CompatibilityChecker>,
    validator: Arc<CloneTokenValidator>,
    expectations: Arc<PodExpectations>,
    pod_settings: ClonePodSettings,
}

impl CloneReconciler {
    pub fn new(
        cache: Arc<dyn ObjectCache>,
        client: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        compatibility: Arc<dyn CompatibilityChecker>,
        validator: Arc<CloneTokenValidator>,
        expectations: Arc<PodExpectations>,
        pod_settings: ClonePodSettings,
    ) -> Self {
        Self {
            cache,
            client,
            events,
            compatibility,
            validator,
            expectations,
            pod_settings,
        }
    }

    pub fn expectations(&self) -> &Arc<PodExpectations> {
        &self.expectations
    }

    /// Derive the clone state of `claim`
    pub async fn observe(&self, key: &ObjectKey, claim: &PersistentVolumeClaim) -> Result<CloneState> {
        if clone_request(claim).is_none() {
            return Ok(CloneState::Unrequested);
        }
        if !self.binding_allows_clone(key, claim).await? {
            return Ok(CloneState::Deferred);
        }
        if has_annotation(claim, ANN_CLONE_OF) {
            return Ok(CloneState::Completed);
        }

        let source = self.find_role_pod(key, claim, PodRole::Source)?;
        let target = self.find_role_pod(key, claim, PodRole::Target)?;

        Ok(match (source, target) {
            (Some(source), Some(target)) => CloneState::AwaitingCompletion { source, target },
            _ if !self.expectations.satisfied_expectations(key) || phase_succeeded(claim) => {
                CloneState::Settling
            }
            (source, target) => CloneState::AwaitingPods { source, target },
        })
    }

    /// Clone pods are only scheduled for a bound claim, or a pending one
    /// whose storage class waits for the first consumer.
    async fn binding_allows_clone(&self, key: &ObjectKey, claim: &PersistentVolumeClaim) -> Result<bool> {
        let Some(class_name) = claim
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .filter(|name| !name.is_empty())
        else {
            return Ok(true);
        };

        let storage_class = self.client.get_storage_class(class_name).await?;
        let phase = claim
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        let binding_mode = storage_class.volume_binding_mode.as_deref().unwrap_or_default();

        let allowed = phase == CLAIM_BOUND
            || (phase == CLAIM_PENDING && binding_mode == WAIT_FOR_FIRST_CONSUMER);
        if !allowed {
            debug!(
                claim = %key,
                phase,
                storage_class = class_name,
                binding_mode,
                "Claim is not bound and binding is not deferred to first consumer, ignoring"
            );
        }
        Ok(allowed)
    }

    /// The single pod of `role` for this claim, if any.
    ///
    /// More than one match, or a match the claim does not control, is a
    /// broken invariant and never resolved here.
    fn find_role_pod(
        &self,
        key: &ObjectKey,
        claim: &PersistentVolumeClaim,
        role: PodRole,
    ) -> Result<Option<Arc<Pod>>> {
        let uid = claim
            .uid()
            .ok_or_else(|| Error::MissingField(format!("uid of claim {}", key)))?;
        let namespace = match role {
            PodRole::Source => clone_source(claim)?.namespace,
            PodRole::Target => key.namespace.clone(),
        };

        let mut pods = self
            .cache
            .list_pods(&namespace, &role_pod_selector(&uid, role));
        if pods.len() > 1 {
            return Err(Error::MultiplePods {
                role,
                claim: key.clone(),
            });
        }

        let pod = pods.pop();
        if let Some(pod) = &pod {
            if !is_controlled_by(pod, claim) {
                return Err(Error::NotOwned {
                    pod: ObjectKey::new(pod.namespace().unwrap_or_default(), pod.name_any()),
                    claim: key.clone(),
                });
            }
        }
        Ok(pod)
    }

    /// Act on the claim's current state
    #[instrument(skip(self, key, claim), fields(claim = %key))]
    pub async fn sync(&self, key: &ObjectKey, claim: &PersistentVolumeClaim) -> Result<()> {
        let state = self.observe(key, claim).await?;
        debug!(state = state.name(), "Observed clone state");

        match state {
            CloneState::Unrequested
            | CloneState::Deferred
            | CloneState::Completed
            | CloneState::Settling => Ok(()),
            CloneState::AwaitingPods { source, target } => {
                self.create_missing_pods(key, claim, source, target).await
            }
            CloneState::AwaitingCompletion { source, target } => {
                self.sync_completion(key, claim, &source, &target).await
            }
        }
    }

    async fn create_missing_pods(
        &self,
        key: &ObjectKey,
        claim: &PersistentVolumeClaim,
        source_pod: Option<Arc<Pod>>,
        target_pod: Option<Arc<Pod>>,
    ) -> Result<()> {
        self.expectations.set_expectations(key, 0, 0);

        let source_claim = match self.authorize(key, claim) {
            Ok(source_claim) => source_claim,
            Err(e) => {
                if e.is_rejection() {
                    self.reject(claim, &e).await;
                }
                return Err(e);
            }
        };

        let source_namespace = match source_pod {
            Some(pod) => pod.namespace().unwrap_or_default(),
            None => {
                let pod = cluster::source_pod(&self.pod_settings, claim, &source_claim)?;
                let created = self.create_role_pod(key, PodRole::Source, &pod).await?;
                created
                    .namespace()
                    .or_else(|| source_claim.namespace())
                    .unwrap_or_default()
            }
        };

        if target_pod.is_none() {
            let pod = cluster::target_pod(&self.pod_settings, claim, &source_namespace)?;
            self.create_role_pod(key, PodRole::Target, &pod).await?;
        }
        Ok(())
    }

    /// Resolve the source claim and check that cloning it into `claim` is
    /// both authorized and structurally possible.
    fn authorize(&self, key: &ObjectKey, claim: &PersistentVolumeClaim) -> Result<Arc<PersistentVolumeClaim>> {
        let source_key = clone_source(claim)?;
        let source = self
            .cache
            .get_claim(&source_key)
            .ok_or_else(|| Error::SourceClaimNotFound(source_key.clone()))?;

        let token = claim
            .annotations()
            .get(ANN_CLONE_TOKEN)
            .ok_or(TokenError::Missing)?;
        self.validator
            .validate(token, &source_key, key, Operation::Clone)?;

        self.compatibility.check(
            &source.spec.clone().unwrap_or_default(),
            &claim.spec.clone().unwrap_or_default(),
        )?;
        Ok(source)
    }

    async fn reject(&self, claim: &PersistentVolumeClaim, error: &Error) {
        let reason = match error {
            Error::Unauthorized(e) => e.reason(),
            _ => error.class(),
        };
        metrics::CLONE_REJECTIONS.with_label_values(&[reason]).inc();
        self.events
            .publish(
                &claim.object_ref(&()),
                EventType::Warning,
                ERR_INCOMPATIBLE_PVC,
                ACTION_VALIDATE_CLONE,
                &error.to_string(),
            )
            .await;
    }

    /// Create a role pod under an expectation. A failed create rolls the
    /// expectation back so the next pass may retry immediately.
    async fn create_role_pod(&self, key: &ObjectKey, role: PodRole, pod: &Pod) -> Result<Pod> {
        self.expectations.raise_expectations(key, 1, 0);
        match self.client.create_pod(pod).await {
            Ok(created) => {
                metrics::CLONE_PODS_CREATED
                    .with_label_values(&[role.as_str()])
                    .inc();
                info!(
                    claim = %key,
                    role = %role,
                    pod = %created.name_any(),
                    namespace = created.namespace().as_deref().unwrap_or_default(),
                    "Created clone pod"
                );
                Ok(created)
            }
            Err(e) => {
                self.expectations.creation_observed(key);
                Err(e)
            }
        }
    }

    /// Mirror the target pod's phase onto the claim. The clone is marked
    /// complete and its pods removed only on a pass where the cached claim
    /// already records the succeeded phase, so any cache view of the claim
    /// that outlives the pods still keeps creation out.
    async fn sync_completion(
        &self,
        key: &ObjectKey,
        claim: &PersistentVolumeClaim,
        source: &Pod,
        target: &Pod,
    ) -> Result<()> {
        let phase = target
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();

        let mut annotations = BTreeMap::new();
        if !phase.is_empty() && claim.annotations().get(ANN_POD_PHASE) != Some(&phase) {
            annotations.insert(ANN_POD_PHASE.to_string(), phase.clone());
        }
        let completing = phase_succeeded(claim);
        if completing {
            annotations.insert(ANN_CLONE_OF.to_string(), "true".to_string());
        }
        let mut labels = BTreeMap::new();
        if !has_label(claim, LABEL_OWNER_KEY, LABEL_OWNER_VALUE) {
            labels.insert(LABEL_OWNER_KEY.to_string(), LABEL_OWNER_VALUE.to_string());
        }

        if annotations.is_empty() && labels.is_empty() {
            return Ok(());
        }

        let updated = self.client.update_claim(claim, &annotations, &labels).await?;
        debug!(claim = %key, phase = %phase, "Updated claim from target pod");

        if completing && updated.annotations().get(ANN_CLONE_OF).map(String::as_str) == Some("true") {
            metrics::CLONES_COMPLETED.inc();
            info!(claim = %key, "Clone completed, removing clone pods");
            self.delete_clone_pods(key, &[(PodRole::Source, source), (PodRole::Target, target)])
                .await;
        }
        Ok(())
    }

    /// Best effort: failures are logged and counted, never returned
    async fn delete_clone_pods(&self, key: &ObjectKey, pods: &[(PodRole, &Pod)]) {
        for (role, pod) in pods {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            self.expectations.raise_expectations(key, 0, 1);
            let outcome = match self.client.delete_pod(&namespace, &name).await {
                Ok(()) => "deleted",
                Err(e) => {
                    self.expectations.deletion_observed(key);
                    warn!(
                        claim = %key,
                        role = %role,
                        pod = %name,
                        namespace = %namespace,
                        error = %e,
                        "Failed to delete clone pod"
                    );
                    "failed"
                }
            };
            metrics::CLONE_PODS_DELETED
                .with_label_values(&[role.as_str(), outcome])
                .inc();
        }
    }
}

#[async_trait]
impl KeyedReconciler for CloneReconciler {
    type Object = PersistentVolumeClaim;

    const KIND: &'static str = "PersistentVolumeClaim";

    fn key_of(claim: &PersistentVolumeClaim) -> Result<ObjectKey> {
        ObjectKey::of_claim(claim)
    }

    fn resolve_by_key(&self, key: &ObjectKey) -> Option<Arc<PersistentVolumeClaim>> {
        self.cache.get_claim(key)
    }

    fn forget(&self, key: &ObjectKey) {
        debug!(claim = %key, "Claim gone, dropping expectations");
        self.expectations.delete_expectations(key);
    }

    async fn reconcile(&self, key: &ObjectKey, claim: Arc<PersistentVolumeClaim>) -> Result<()> {
        self.sync(key, &claim).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MockKubeClient, ObjectCache};
    use crate::annotations::{PodSelector, ANN_CLONE_REQUEST, LABEL_CLONE_UNIQUE_ID};
    use crate::compat::SpecCompatibility;
    use k8s_openapi::api::core::v1::{ObjectReference, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use jsonwebtoken::DecodingKey;

    struct StaticCache {
        pods: Vec<Arc<Pod>>,
    }

    impl ObjectCache for StaticCache {
        fn get_claim(&self, _key: &ObjectKey) -> Option<Arc<PersistentVolumeClaim>> {
            None
        }

        fn list_pods(&self, namespace: &str, selector: &PodSelector) -> Vec<Arc<Pod>> {
            self.pods
                .iter()
                .filter(|p| p.namespace().as_deref() == Some(namespace) && selector.matches(p.labels()))
                .cloned()
                .collect()
        }
    }

    struct SilentEvents;

    #[async_trait]
    impl EventPublisher for SilentEvents {
        async fn publish(&self, _: &ObjectReference, _: EventType, _: &str, _: &str, _: &str) {}
    }

    fn claim() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("target".into()),
                namespace: Some("ns".into()),
                uid: Some("uid-1".into()),
                annotations: Some(BTreeMap::from([(
                    ANN_CLONE_REQUEST.to_string(),
                    "ns2/source".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn role_pod(namespace: &str, name: &str, role: PodRole, phase: &str) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                labels: Some(BTreeMap::from([(
                    LABEL_CLONE_UNIQUE_ID.to_string(),
                    crate::annotations::clone_unique_id("uid-1", role),
                )])),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".into(),
                    kind: "PersistentVolumeClaim".into(),
                    name: "target".into(),
                    uid: "uid-1".into(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn reconciler(client: MockKubeClient, pods: Vec<Arc<Pod>>) -> CloneReconciler {
        CloneReconciler::new(
            Arc::new(StaticCache { pods }),
            Arc::new(client),
            Arc::new(SilentEvents),
            Arc::new(SpecCompatibility),
            Arc::new(CloneTokenValidator::for_clone(
                DecodingKey::from_rsa_pem(include_bytes!("../../tests/fixtures/apiserver.pub")).unwrap(),
            )),
            Arc::new(PodExpectations::new()),
            ClonePodSettings {
                image: "cloner".into(),
                pull_policy: "IfNotPresent".into(),
                verbose: 1,
            },
        )
    }

    #[tokio::test]
    async fn deletion_failures_do_not_fail_completion() {
        let mut client = MockKubeClient::new();
        client.expect_update_claim().times(1).returning(|claim, annotations, labels| {
            let mut updated = claim.clone();
            cluster::merge_metadata(&mut updated, annotations, labels);
            Ok(updated)
        });
        client
            .expect_delete_pod()
            .times(2)
            .returning(|_, _| Err(Error::config("delete refused")));

        let pods = vec![
            role_pod("ns2", "src", PodRole::Source, "Running"),
            role_pod("ns", "tgt", PodRole::Target, "Succeeded"),
        ];
        let r = reconciler(client, pods);
        let key = ObjectKey::new("ns", "target");
        let mut mirrored = claim();
        mirrored
            .annotations_mut()
            .insert(ANN_POD_PHASE.to_string(), "Succeeded".to_string());
        r.sync(&key, &mirrored).await.unwrap();
        // Refused deletes are not waited for
        assert!(r.expectations().satisfied_expectations(&key));
    }

    #[tokio::test]
    async fn completion_waits_for_pod_deletions_to_be_seen() {
        let mut client = MockKubeClient::new();
        client.expect_update_claim().times(1).returning(|claim, annotations, labels| {
            let mut updated = claim.clone();
            cluster::merge_metadata(&mut updated, annotations, labels);
            Ok(updated)
        });
        client.expect_delete_pod().times(2).returning(|_, _| Ok(()));

        let pods = vec![
            role_pod("ns2", "src", PodRole::Source, "Running"),
            role_pod("ns", "tgt", PodRole::Target, "Succeeded"),
        ];
        let r = reconciler(client, pods);
        let key = ObjectKey::new("ns", "target");
        let mut mirrored = claim();
        mirrored
            .annotations_mut()
            .insert(ANN_POD_PHASE.to_string(), "Succeeded".to_string());
        r.sync(&key, &mirrored).await.unwrap();

        assert!(!r.expectations().satisfied_expectations(&key));
        r.expectations().deletion_observed(&key);
        r.expectations().deletion_observed(&key);
        assert!(r.expectations().satisfied_expectations(&key));
    }

    #[tokio::test]
    async fn first_succeeded_pass_only_records_the_phase() {
        let mut client = MockKubeClient::new();
        client
            .expect_update_claim()
            .withf(|_, annotations, _| {
                annotations.get(ANN_POD_PHASE).map(String::as_str) == Some("Succeeded")
                    && !annotations.contains_key(ANN_CLONE_OF)
            })
            .times(1)
            .returning(|claim, annotations, labels| {
                let mut updated = claim.clone();
                cluster::merge_metadata(&mut updated, annotations, labels);
                Ok(updated)
            });
        client.expect_delete_pod().never();

        let pods = vec![
            role_pod("ns2", "src", PodRole::Source, "Running"),
            role_pod("ns", "tgt", PodRole::Target, "Succeeded"),
        ];
        let r = reconciler(client, pods);
        r.sync(&ObjectKey::new("ns", "target"), &claim()).await.unwrap();
    }

    #[tokio::test]
    async fn running_target_pod_only_mirrors_phase() {
        let mut client = MockKubeClient::new();
        client
            .expect_update_claim()
            .withf(|_, annotations, _| {
                annotations.get(ANN_POD_PHASE).map(String::as_str) == Some("Running")
                    && !annotations.contains_key(ANN_CLONE_OF)
            })
            .times(1)
            .returning(|claim, annotations, labels| {
                let mut updated = claim.clone();
                cluster::merge_metadata(&mut updated, annotations, labels);
                Ok(updated)
            });
        client.expect_delete_pod().never();

        let pods = vec![
            role_pod("ns2", "src", PodRole::Source, "Running"),
            role_pod("ns", "tgt", PodRole::Target, "Running"),
        ];
        let r = reconciler(client, pods);
        r.sync(&ObjectKey::new("ns", "target"), &claim()).await.unwrap();
    }

    #[tokio::test]
    async fn foreign_target_pod_is_a_consistency_error() {
        let mut foreign = (*role_pod("ns", "tgt", PodRole::Target, "Running")).clone();
        foreign.metadata.owner_references.as_mut().unwrap()[0].uid = "someone-else".into();

        let client = MockKubeClient::new();
        let r = reconciler(
            client,
            vec![role_pod("ns2", "src", PodRole::Source, "Running"), Arc::new(foreign)],
        );
        let err = r
            .sync(&ObjectKey::new("ns", "target"), &claim())
            .await
            .unwrap_err();
        assert!(err.is_consistency_violation());
        assert!(err.to_string().contains("ns/tgt"));
    }

    #[tokio::test]
    async fn pending_claim_on_immediate_class_is_deferred() {
        let mut client = MockKubeClient::new();
        client.expect_get_storage_class().returning(|_| {
            Ok(k8s_openapi::api::storage::v1::StorageClass {
                volume_binding_mode: Some("Immediate".into()),
                ..Default::default()
            })
        });

        let mut pending = claim();
        pending.spec = Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
            storage_class_name: Some("fast".into()),
            ..Default::default()
        });
        pending.status = Some(k8s_openapi::api::core::v1::PersistentVolumeClaimStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        });

        let r = reconciler(client, vec![]);
        let state = r
            .observe(&ObjectKey::new("ns", "target"), &pending)
            .await
            .unwrap();
        assert!(matches!(state, CloneState::Deferred));
    }
}

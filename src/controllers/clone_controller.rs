//! Clone controller
//!
//! Watches claims and clone pods, keeps both in reflector stores, and
//! dispatches claim keys to the [`CloneReconciler`]. Pod events are mapped
//! to the key of the claim that controls the pod.

use std::sync::Arc;

use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};
use tracing::info;

use crate::annotations::{owning_claim_key, ObjectKey, LABEL_CLONE_UNIQUE_ID};
use crate::cluster::{
    ClonePodSettings, KubeClientImpl, KubeEventPublisher, ReflectorCache,
    CLONE_CONTROLLER_AGENT_NAME,
};
use crate::compat::SpecCompatibility;
use crate::expectations::PodExpectations;
use crate::metrics;
use crate::reconcilers::clone::CloneReconciler;
use crate::token::CloneTokenValidator;

/// Run the clone controller until shutdown
pub async fn run(
    client: Client,
    validator: CloneTokenValidator,
    pod_settings: ClonePodSettings,
    workers: u16,
) {
    let expectations = Arc::new(PodExpectations::new());
    let (claim_store, claim_writer) = reflector::store::<PersistentVolumeClaim>();
    let (pod_store, pod_writer) = reflector::store::<Pod>();

    let claims = claim_stream(
        Api::all(client.clone()),
        claim_writer,
        expectations.clone(),
    );
    let pods = pod_stream(
        Api::all(client.clone()),
        pod_writer,
        pod_store.clone(),
        expectations.clone(),
    );

    let reconciler = Arc::new(CloneReconciler::new(
        Arc::new(ReflectorCache::new(claim_store.clone(), pod_store)),
        Arc::new(KubeClientImpl::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client, CLONE_CONTROLLER_AGENT_NAME)),
        Arc::new(SpecCompatibility),
        Arc::new(validator),
        expectations,
        pod_settings,
    ));

    let controller = Controller::for_stream(claims, claim_store).watches_stream(pods, |pod: Pod| {
        owning_claim_key(&pod).map(|key| key.to_object_ref::<PersistentVolumeClaim>())
    });

    info!(workers, "Starting clone controller");
    metrics::CONTROLLER_HEALTH.set(1.0);
    super::run(controller, reconciler, workers).await;
    metrics::CONTROLLER_HEALTH.set(0.0);
    info!("Clone controller stopped");
}

/// Claims as they change; a deleted claim also drops its expectations.
fn claim_stream(
    api: Api<PersistentVolumeClaim>,
    writer: reflector::store::Writer<PersistentVolumeClaim>,
    expectations: Arc<PodExpectations>,
) -> impl Stream<Item = Result<PersistentVolumeClaim, watcher::Error>> + Send + 'static {
    let events = watcher::watcher(api, WatcherConfig::default())
        .default_backoff()
        .map_ok(move |event| {
            forget_deleted_claim(&expectations, &event);
            event
        });
    reflector::reflector(writer, events).applied_objects()
}

/// Clone pods as they change. A pod seen for the first time lowers the
/// creation expectation of its owning claim, a deleted pod its deletion
/// expectation.
fn pod_stream(
    api: Api<Pod>,
    writer: reflector::store::Writer<Pod>,
    known: Store<Pod>,
    expectations: Arc<PodExpectations>,
) -> impl Stream<Item = Result<Pod, watcher::Error>> + Send + 'static {
    let events = watcher::watcher(api, WatcherConfig::default().labels(LABEL_CLONE_UNIQUE_ID))
        .default_backoff()
        .map_ok(move |event| {
            observe_pod_event(&known, &expectations, &event);
            event
        });
    reflector::reflector(writer, events).touched_objects()
}

fn forget_deleted_claim(expectations: &PodExpectations, event: &watcher::Event<PersistentVolumeClaim>) {
    if let watcher::Event::Delete(claim) = event {
        if let Ok(key) = ObjectKey::of_claim(claim) {
            expectations.delete_expectations(&key);
        }
    }
}

fn observe_pod_event(known: &Store<Pod>, expectations: &PodExpectations, event: &watcher::Event<Pod>) {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
            if known.get(&ObjectRef::from_obj(pod)).is_some() {
                return;
            }
            if let Some(key) = owning_claim_key(pod) {
                expectations.creation_observed(&key);
            }
        }
        watcher::Event::Delete(pod) => {
            if let Some(key) = owning_claim_key(pod) {
                expectations.deletion_observed(&key);
            }
        }
        _ => {}
    }
}

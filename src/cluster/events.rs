//! Kubernetes Event recording
//!
//! Wraps `kube::runtime::events::Recorder`. Events are fire-and-forget: a
//! failed publish is logged and never breaks reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::Client;
use tracing::warn;

pub use kube::runtime::events::EventType;

/// Component name events are reported under
pub const CLONE_CONTROLLER_AGENT_NAME: &str = "clone-controller";

/// Reason recorded when a clone is not authorized or not structurally possible
pub const ERR_INCOMPATIBLE_PVC: &str = "ErrIncompatiblePVC";

/// Action recorded when the source and target of a clone are checked
pub const ACTION_VALIDATE_CLONE: &str = "ValidateClone";

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `object`. Never fails.
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: &str,
    );
}

/// Publishes Events through the kube runtime recorder
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller` appears as the reporting component of every Event
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: &str,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                reason,
                action,
                object = object.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

//! Kubernetes controllers
//!
//! The runner here is generic over a [`KeyedReconciler`]: it owns dispatch
//! (dedup, single-flight per key, bounded concurrency), the retry policy,
//! and error logging. Reconcilers only resolve keys and reconcile objects.

mod clone_controller;

pub use clone_controller::run as run_clone_controller;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::annotations::ObjectKey;
use crate::error::{Error, Result};
use crate::metrics;

/// Capabilities the runner needs from a reconciler
#[async_trait]
pub trait KeyedReconciler: Send + Sync + 'static {
    type Object: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static;

    /// Kind label used in logs and metrics
    const KIND: &'static str;

    /// Reconciliation key of a watched object
    fn key_of(object: &Self::Object) -> Result<ObjectKey>;

    /// Current cached object for `key`, if it still exists
    fn resolve_by_key(&self, key: &ObjectKey) -> Option<Arc<Self::Object>>;

    /// Drop any per-key bookkeeping once the object is gone
    fn forget(&self, key: &ObjectKey);

    /// Converge the object stored under `key`
    async fn reconcile(&self, key: &ObjectKey, object: Arc<Self::Object>) -> Result<()>;
}

/// Resolve `key` against the cache and reconcile whatever is found there
pub async fn process_key<R: KeyedReconciler>(reconciler: &R, key: &ObjectKey) -> Result<()> {
    match reconciler.resolve_by_key(key) {
        Some(object) => reconciler.reconcile(key, object).await,
        None => {
            reconciler.forget(key);
            Ok(())
        }
    }
}

/// Delay before a key that failed with `error` is retried
pub fn retry_delay(error: &Error) -> Duration {
    match error {
        Error::Kube(_) | Error::Io(_) | Error::Serialization(_) => Duration::from_secs(5),
        Error::SourceClaimNotFound(_) => Duration::from_secs(10),
        Error::Unauthorized(_) | Error::Incompatible(_) => Duration::from_secs(30),
        Error::MalformedCloneRequest(_)
        | Error::MultiplePods { .. }
        | Error::NotOwned { .. }
        | Error::MissingField(_)
        | Error::Config(_) => Duration::from_secs(60),
    }
}

/// Drive `reconciler` from a controller's trigger streams until shutdown.
///
/// At most `workers` keys are reconciled at once. A SIGINT or SIGTERM stops
/// new keys from being picked up and lets in-flight reconciliations finish.
pub async fn run<R: KeyedReconciler>(controller: Controller<R::Object>, reconciler: Arc<R>, workers: u16) {
    controller
        .with_config(controller::Config::default().concurrency(workers))
        .shutdown_on_signal()
        .run(reconcile::<R>, error_policy::<R>, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        "Reconciled {}",
                        R::KIND
                    );
                }
                // Already logged by the error policy
                Err(controller::Error::ReconcilerFailed(_, _)) => {}
                Err(e) => {
                    warn!(error = %e, "Controller error");
                }
            }
        })
        .await;
}

async fn reconcile<R: KeyedReconciler>(obj: Arc<R::Object>, ctx: Arc<R>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[R::KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[R::KIND]).inc();

    let key = R::key_of(&obj)?;
    process_key(ctx.as_ref(), &key).await?;
    Ok(Action::await_change())
}

fn error_policy<R: KeyedReconciler>(obj: Arc<R::Object>, error: &Error, _ctx: Arc<R>) -> Action {
    let delay = retry_delay(error);
    error!(
        kind = R::KIND,
        name = obj.meta().name.as_deref().unwrap_or_default(),
        namespace = obj.meta().namespace.as_deref().unwrap_or_default(),
        class = error.class(),
        retry_in_secs = delay.as_secs(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[R::KIND, error.class()])
        .inc();
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::PodRole;
    use crate::token::TokenError;

    #[test]
    fn consistency_errors_back_off_longer_than_transient_ones() {
        let transient = retry_delay(&Error::SourceClaimNotFound(ObjectKey::new("ns2", "source")));
        let consistency = retry_delay(&Error::MultiplePods {
            role: PodRole::Source,
            claim: ObjectKey::new("ns", "target"),
        });
        assert_eq!(transient, Duration::from_secs(10));
        assert_eq!(consistency, Duration::from_secs(60));
        assert_eq!(
            retry_delay(&Error::from(TokenError::Expired)),
            Duration::from_secs(30)
        );
    }
}

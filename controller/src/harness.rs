use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller as RuntimeController};
use kube::{Api, Resource, ResourceExt};
use tracing::warn;

/// Thin wrapper carried over from the teacher's reconciliation harness, so every
/// `Reconciler` impl gets a shared `Arc<Context<Self>>` to close over instead of juggling its
/// own `Arc` bookkeeping.
pub struct Context<T>(pub T);

impl<T> Context<T> {
    pub fn new(inner: T) -> Arc<Self> {
        Arc::new(Self(inner))
    }
}

impl<T> Deref for Context<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// A reconciler over one Kubernetes resource kind `K`, generalized from the teacher's
/// single-CRD `ClusterController` to drive the Pod Reconciler (C5), which watches workload
/// `Pod`s (see `crate::reconcile`).
#[async_trait]
pub trait Reconciler<K>: Send + Sync + 'static
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn reconcile_once(&self, obj: Arc<K>) -> Result<Action, Self::Error>;

    fn handle_error(&self, obj: &Arc<K>, err: &Self::Error) -> Action {
        warn!(name = %obj.name_any(), error = %err, "reconciliation failed, requeuing with backoff");
        Action::requeue(Duration::from_secs(15))
    }
}

/// Drives `ctx`'s reconciler against every change to objects in `api`, forever. Distinct object
/// keys are reconciled concurrently by `kube::runtime::Controller`'s internal scheduler; the
/// same key is never reconciled concurrently (§4.5).
pub async fn run<K, C>(ctx: Arc<Context<C>>, api: Api<K>)
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static,
    C: Reconciler<K>,
{
    RuntimeController::new(api, watcher::Config::default())
        .run(
            |obj, ctx| async move { ctx.reconcile_once(obj).await },
            |obj, err, ctx| ctx.handle_error(&obj, err),
            ctx,
        )
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "reconciler stream produced an error");
            }
        })
        .await;
}

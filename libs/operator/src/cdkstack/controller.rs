use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, ResourceExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::Reporter;
use kube::runtime::watcher;
use kube::{Client, Resource};
use tracing::{error, field, info, instrument, warn, Span};

use crate::cdkstack::{deploy, destroy};
use crate::crd::{CdkTsStack, Phase, FINALIZER};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::store::ResourceStoreGateway;
use crate::telemetry;

pub static CONTROLLER_ID: &str = "cdkts-operator";

const SKIP_REQUEUE: Duration = Duration::from_secs(30);

type RetryKey = (String, String);

/// Shared between every reconcile invocation. `retries` tracks the bounded-retry-with-backoff
/// contract per `(namespace, name)`: `error_policy` is a plain synchronous callback, so this is
/// a `std::sync::Mutex` rather than a `tokio::sync::Mutex`.
pub struct Context {
    pub store: ResourceStoreGateway,
    pub metrics: Arc<MetricsSink>,
    max_retries: u32,
    retry_backoff: Duration,
    retries: Mutex<HashMap<RetryKey, u32>>,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Arc<MetricsSink>,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: ResourceStoreGateway::new(client, Reporter::from(CONTROLLER_ID)),
            metrics,
            max_retries,
            retry_backoff,
            retries: Mutex::new(HashMap::new()),
        })
    }

    fn clear_retries(&self, key: &RetryKey) {
        self.retries.lock().expect("retry map poisoned").remove(key);
    }
}

/// The decision `reconcile` makes purely from `obj`'s metadata, spec, and status, with no I/O.
/// Kept separate from `reconcile` itself so the dispatch table of §4.5.1 is unit-testable
/// without a Kubernetes client.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Dispatch {
    /// Deletion already in progress without this controller's finalizer: another actor's concern.
    ForeignDeletion,
    AddFinalizer,
    Destroy,
    /// `actions.destroy == false`: the AWS stack is intentionally left behind.
    OrphanDelete,
    /// Owned phase, `Deploying`, or a sweeper-parked `Failed` message: let the owner finish.
    Skip,
    DeployDisabled,
    Advance,
}

fn has_finalizer(obj: &CdkTsStack) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

/// `status.phase == Failed` with a message written by a sweeper that owns its own retry cadence
/// (see the auto-redeploy marker in `cdkstack::git_sync`). The event reconciler must not
/// cross-retry these; the sweeper alone decides when to try again.
fn is_sweeper_owned_failure(message: &str) -> bool {
    message.contains("Auto deployment failed") || message.contains("Git sync")
}

fn classify(obj: &CdkTsStack) -> Dispatch {
    if obj.meta().deletion_timestamp.is_some() {
        return if !has_finalizer(obj) {
            Dispatch::ForeignDeletion
        } else if obj.spec.actions.destroy {
            Dispatch::Destroy
        } else {
            Dispatch::OrphanDelete
        };
    }

    if !has_finalizer(obj) {
        return Dispatch::AddFinalizer;
    }

    let status = obj.status.clone().unwrap_or_default();
    match status.phase {
        Phase::DriftChecking | Phase::GitSyncChecking | Phase::Deleting | Phase::Deploying => {
            Dispatch::Skip
        }
        Phase::Unknown(_) => Dispatch::Skip,
        Phase::Failed if is_sweeper_owned_failure(&status.message) => Dispatch::Skip,
        Phase::Empty if !obj.spec.actions.deploy => Dispatch::DeployDisabled,
        Phase::Empty | Phase::Cloning | Phase::Installing | Phase::Succeeded | Phase::Failed => {
            Dispatch::Advance
        }
    }
}

#[instrument(skip(ctx, obj), fields(trace_id))]
async fn reconcile(obj: Arc<CdkTsStack>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));

    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::ConfigError("CdkTsStack must be namespaced".to_owned()))?;
    let name = obj.name_any();

    let result = dispatch(&obj, &namespace, &name, &ctx).await;
    if result.is_ok() {
        ctx.clear_retries(&(namespace, name));
    }
    result
}

async fn dispatch(
    obj: &CdkTsStack,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action> {
    match classify(obj) {
        Dispatch::ForeignDeletion => {
            info!(namespace, name, "deletion in progress without our finalizer, ignoring");
            Ok(Action::await_change())
        }
        Dispatch::AddFinalizer => {
            ctx.store.add_finalizer(namespace, name).await?;
            info!(namespace, name, "finalizer added");
            Ok(Action::await_change())
        }
        Dispatch::Destroy => {
            ctx.store
                .patch_status(namespace, name, Phase::Deleting, "Destroying AWS stack before removal")
                .await?;
            if let Err(e) = destroy::run(&ctx.store, obj, namespace, name).await {
                warn!(
                    namespace,
                    name,
                    error = %e,
                    error_label = %e.metric_label(),
                    "destroy workflow failed; finalizer removed regardless"
                );
            }
            ctx.store.remove_finalizer(namespace, name).await?;
            Ok(Action::await_change())
        }
        Dispatch::OrphanDelete => {
            ctx.store
                .patch_status(
                    namespace,
                    name,
                    Phase::Deleting,
                    "Destroy action disabled; AWS stack is orphaned",
                )
                .await?;
            ctx.store.remove_finalizer(namespace, name).await?;
            Ok(Action::await_change())
        }
        Dispatch::Skip => Ok(Action::requeue(SKIP_REQUEUE)),
        Dispatch::DeployDisabled => {
            ctx.store
                .patch_status(namespace, name, Phase::Failed, "Deploy action is disabled")
                .await?;
            Ok(Action::await_change())
        }
        Dispatch::Advance => {
            let phase = obj.status.clone().unwrap_or_default().phase;
            deploy::advance(&ctx.store, obj, namespace, name, &phase).await?;
            Ok(Action::await_change())
        }
    }
}

fn error_policy(obj: Arc<CdkTsStack>, error: &Error, ctx: Arc<Context>) -> Action {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    warn!(
        namespace,
        name,
        error = %error,
        error_label = %error.metric_label(),
        "reconcile failed"
    );

    let key = (namespace, name);
    let mut retries = ctx.retries.lock().expect("retry map poisoned");
    let attempt = retries.entry(key.clone()).or_insert(0);
    *attempt += 1;
    if *attempt > ctx.max_retries {
        retries.remove(&key);
        return Action::await_change();
    }
    Action::requeue(ctx.retry_backoff)
}

/// Wires the watch stream to `reconcile`/`error_policy` and runs until shutdown signalled.
/// Exits the process if the CRD is not installed, mirroring the teacher's own startup check.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let api: Api<CdkTsStack> = Api::all(client);
    if let Err(e) = api.list(&Default::default()).await {
        error!(error = %e, "CdkTsStack is not queryable; is the CRD installed?");
        info!("install with: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "reconcile attempt exhausted its retries");
            }
        })
        .await;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{Actions, CdkTsStackSpec, CdkTsStackStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn base() -> CdkTsStack {
        let mut obj = CdkTsStack::new(
            "my-stack",
            CdkTsStackSpec {
                credentials_secret_name: "creds".to_owned(),
                ..Default::default()
            },
        );
        obj.meta_mut().namespace = Some("default".to_owned());
        obj
    }

    fn with_finalizer(mut obj: CdkTsStack) -> CdkTsStack {
        obj.finalizers_mut().push(FINALIZER.to_owned());
        obj
    }

    fn with_phase(mut obj: CdkTsStack, phase: Phase) -> CdkTsStack {
        obj.status = Some(CdkTsStackStatus { phase, ..Default::default() });
        obj
    }

    #[test]
    fn missing_finalizer_gets_added_before_anything_else() {
        assert_eq!(classify(&base()), Dispatch::AddFinalizer);
    }

    #[test]
    fn deploy_action_disabled_blocks_empty_phase() {
        let mut obj = with_finalizer(base());
        obj.spec.actions = Actions::default();
        assert!(!obj.spec.actions.deploy);
        assert_eq!(classify(&obj), Dispatch::DeployDisabled);
    }

    #[test]
    fn deploy_action_enabled_advances_from_empty() {
        let mut obj = with_finalizer(base());
        obj.spec.actions.deploy = true;
        assert_eq!(classify(&obj), Dispatch::Advance);
    }

    #[test]
    fn mid_clone_phase_advances_regardless_of_deploy_flag() {
        // Deploy was already permitted once to reach `Cloning`; a later spec edit disabling it
        // does not freeze an in-flight transition.
        let mut obj = with_phase(with_finalizer(base()), Phase::Cloning);
        obj.spec.actions.deploy = false;
        assert_eq!(classify(&obj), Dispatch::Advance);
    }

    #[test]
    fn owned_phases_are_skipped() {
        for phase in [Phase::DriftChecking, Phase::GitSyncChecking, Phase::Deleting, Phase::Deploying] {
            let obj = with_phase(with_finalizer(base()), phase);
            assert_eq!(classify(&obj), Dispatch::Skip);
        }
    }

    #[test]
    fn unknown_phase_is_skipped_not_errored() {
        let obj = with_phase(with_finalizer(base()), Phase::Unknown("SomeFuturePhase".to_owned()));
        assert_eq!(classify(&obj), Dispatch::Skip);
    }

    #[test]
    fn sweeper_owned_failure_message_is_skipped() {
        let mut obj = with_phase(with_finalizer(base()), Phase::Failed);
        obj.status.as_mut().unwrap().message =
            "Auto deployment failed - Git changes pending manual deployment".to_owned();
        assert_eq!(classify(&obj), Dispatch::Skip);
    }

    #[test]
    fn ordinary_failed_phase_advances_for_retry() {
        let mut obj = with_phase(with_finalizer(base()), Phase::Failed);
        obj.status.as_mut().unwrap().message = "npm ci failed (exit 1): ...".to_owned();
        assert_eq!(classify(&obj), Dispatch::Advance);
    }

    #[test]
    fn deletion_with_our_finalizer_and_destroy_enabled_destroys() {
        let mut obj = with_finalizer(base());
        obj.spec.actions.destroy = true;
        obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(classify(&obj), Dispatch::Destroy);
    }

    #[test]
    fn deletion_with_destroy_disabled_orphans() {
        let mut obj = with_finalizer(base());
        obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(classify(&obj), Dispatch::OrphanDelete);
    }

    #[test]
    fn deletion_without_our_finalizer_is_ignored() {
        let mut obj = base();
        obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(classify(&obj), Dispatch::ForeignDeletion);
    }

    /// Mocked-apiserver test, following the teacher's `tower_test::mock::pair` harness: a
    /// finalizer-less object dispatches into exactly one PATCH request, adding the finalizer.
    mod mocked_apiserver {
        use super::*;
        use http::{Request, Response};
        use kube::client::Body;
        use kube::Client;

        #[tokio::test]
        async fn add_finalizer_dispatch_patches_the_object_once() {
            let (mock_service, mut handle) =
                tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let client = Client::new(mock_service, "default");
            let store = ResourceStoreGateway::new(client, Reporter::from(CONTROLLER_ID));

            let obj = base();
            assert_eq!(classify(&obj), Dispatch::AddFinalizer);

            let server = tokio::spawn(async move {
                // `add_finalizer` reads the object first to check for an existing finalizer.
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), http::Method::GET);
                let response = serde_json::to_vec(&obj).unwrap();
                send.send_response(Response::builder().body(Body::from(response)).unwrap());

                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), http::Method::PATCH);
                assert!(request
                    .uri()
                    .to_string()
                    .starts_with("/apis/awscdk.dev/v1alpha1/namespaces/default/cdktsstacks/my-stack"));

                let mut finalized = obj.clone();
                finalized.finalizers_mut().push(FINALIZER.to_owned());
                let response = serde_json::to_vec(&finalized).unwrap();
                send.send_response(Response::builder().body(Body::from(response)).unwrap());
            });

            store.add_finalizer("default", "my-stack").await.unwrap();
            tokio::time::timeout(std::time::Duration::from_secs(1), server)
                .await
                .expect("timeout on mock apiserver")
                .expect("scenario succeeded");
        }
    }
}

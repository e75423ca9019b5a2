use std::sync::Arc;

use kube::runtime::events::EventType;
use tracing::warn;

use crate::cdkstack::deploy::hook_ctx;
use crate::cdkstack::hook_runner;
use crate::cdkstack::project;
use crate::credentials::AwsCredentials;
use crate::crd::{CdkTsStack, Phase};
use crate::error::Result;
use crate::hooks::HookName;
use crate::metrics::{MetricsSink, DRIFTS_DETECTED_TOTAL, DRIFT_CHECKS_TOTAL, DRIFT_STATUS, DRIFT_STATUS_GROUP};
use crate::process::{ProcessRunner, DEFAULT_TIMEOUT};
use crate::store::ResourceStoreGateway;
use crate::workspace::Workspace;

/// Runs one drift check for `obj`, assumed already confirmed to be in `Succeeded` with
/// `actions.driftDetection` enabled. Patches `DriftChecking` at the start (an owned phase: only
/// this function may transition out of it) and back to `Succeeded` with `driftDetected` and
/// `lastDriftCheck` set at the end, regardless of outcome.
pub async fn check(
    store: &ResourceStoreGateway,
    metrics: &Arc<MetricsSink>,
    obj: &CdkTsStack,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let spec = &obj.spec;
    let labels = crate::crd::MetricLabels {
        namespace: namespace.to_owned(),
        resource_name: name.to_owned(),
        aws_region: spec.aws_region.clone(),
        stack_name: spec.stack_name.clone(),
    }
    .as_map();

    store
        .patch_status(namespace, name, Phase::DriftChecking, "Checking for infrastructure drift")
        .await?;
    store
        .emit_event(namespace, obj, EventType::Normal, "DriftCheckStart", "Starting drift check")
        .await;

    let resource_key = format!("{namespace}.{name}");
    let workspace = Workspace::new("drift", &resource_key).await?;

    let clone_output =
        project::clone_into(store.client().clone(), namespace, workspace.path(), spec).await?;
    if !clone_output.success() {
        store
            .patch_status(namespace, name, Phase::Failed, "Drift check: unable to clone repository")
            .await?;
        return Ok(());
    }

    let project_dir = workspace.project_dir(&spec.path);
    if let Some(output) = project::install_dependencies(&project_dir).await? {
        if !output.success() {
            store
                .patch_status(namespace, name, Phase::Failed, "Drift check: npm ci failed")
                .await?;
            return Ok(());
        }
    }

    let credentials =
        AwsCredentials::load(store.client().clone(), namespace, &spec.credentials_secret_name)
            .await?;
    let mut env = credentials.env(&spec.aws_region);
    env.insert("CDK_DEFAULT_REGION".to_owned(), spec.aws_region.clone());

    let ctx = hook_ctx(namespace, name, spec);
    hook_runner::run(
        store,
        obj,
        namespace,
        HookName::BeforeDriftDetection,
        spec.lifecycle_hooks.before_drift_detection.as_deref(),
        &ctx,
        &env,
        &project_dir,
    )
    .await?;

    let mut args = vec!["drift".to_owned(), "--fail".to_owned()];
    args.extend(spec.stack_target());

    let output =
        ProcessRunner::run("DriftChecking", "cdk", &args, &project_dir, &env, DEFAULT_TIMEOUT).await?;

    // exit 0 = no drift; exit 1 = drift or failure, disambiguated by substring.
    let drift_detected = output.exit_code != 0 && ProcessRunner::output_contains(&output.output, "drift");

    if output.exit_code != 0 && !drift_detected {
        warn!(namespace, name, exit_code = output.exit_code, "cdk drift command failed");
    }

    store
        .patch_status_with(
            namespace,
            name,
            Phase::Succeeded,
            obj.status.clone().unwrap_or_default().message,
            |status| {
                status.drift_detected = drift_detected;
                status.last_drift_check = Some(chrono::Utc::now());
            },
        )
        .await?;

    if drift_detected {
        store
            .emit_event(
                namespace,
                obj,
                EventType::Warning,
                "DriftDetected",
                "Infrastructure drift detected outside the CDK control plane",
            )
            .await;
    }

    metrics.counter_add(DRIFT_CHECKS_TOTAL, 1.0, labels.clone()).await?;
    if drift_detected {
        metrics.counter_add(DRIFTS_DETECTED_TOTAL, 1.0, labels.clone()).await?;
    }
    metrics
        .gauge_set(
            DRIFT_STATUS,
            if drift_detected { 1.0 } else { 0.0 },
            labels,
            DRIFT_STATUS_GROUP,
        )
        .await?;

    let mut after_env = env.clone();
    after_env.insert(
        "DRIFT_DETECTED".to_owned(),
        drift_detected.to_string(),
    );
    hook_runner::run(
        store,
        obj,
        namespace,
        HookName::AfterDriftDetection,
        spec.lifecycle_hooks.after_drift_detection.as_deref(),
        &ctx,
        &after_env,
        &project_dir,
    )
    .await?;

    workspace.remove().await?;
    Ok(())
}

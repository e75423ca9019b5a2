use std::sync::Arc;

use kube::runtime::events::EventType;
use tracing::warn;

use crate::cdkstack::deploy::{display_target, hook_ctx};
use crate::cdkstack::hook_runner;
use crate::cdkstack::project;
use crate::credentials::AwsCredentials;
use crate::crd::{CdkTsStack, Phase};
use crate::error::Result;
use crate::hooks::HookName;
use crate::metrics::{
    MetricsSink, GIT_CHANGES_DETECTED_TOTAL, GIT_SYNC_PENDING, GIT_SYNC_STATUS_GROUP,
};
use crate::process::{ProcessRunner, CDK_DEPLOY_TIMEOUT, DEFAULT_TIMEOUT};
use crate::store::ResourceStoreGateway;
use crate::workspace::Workspace;

/// The exact substring `reconcile` looks for in `status.message` to recognize a `Failed` auto
/// redeploy and retry it on the next sweep instead of treating it as a manual-intervention
/// failure like a deploy or install failure.
pub const AUTO_REDEPLOY_FAILED_MARKER: &str =
    "Auto deployment failed - Git changes pending manual deployment";

/// Runs one Git-sync check for `obj`, assumed already confirmed to be in `Succeeded` with
/// `actions.deploy` enabled. Diffs the live stack against the cloned Git project via
/// `cdk diff --fail`; when changes are pending and both `autoRedeploy` and `deploy` are allowed,
/// redeploys automatically. `GitSyncChecking` is an owned phase: only this function transitions
/// out of it.
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
        .patch_status(namespace, name, Phase::GitSyncChecking, "Checking Git for pending changes")
        .await?;
    store
        .emit_event(namespace, obj, EventType::Normal, "GitSyncCheckStart", "Checking Git for drift against the live stack")
        .await;

    let resource_key = format!("{namespace}.{name}");
    let workspace = Workspace::new("git-sync", &resource_key).await?;

    let clone_output =
        project::clone_into(store.client().clone(), namespace, workspace.path(), spec).await?;
    if !clone_output.success() {
        store
            .patch_status(namespace, name, Phase::Failed, "Git sync: unable to clone repository")
            .await?;
        return Ok(());
    }

    let project_dir = workspace.project_dir(&spec.path);
    if let Some(output) = project::install_dependencies(&project_dir).await? {
        if !output.success() {
            store
                .patch_status(namespace, name, Phase::Failed, "Git sync: npm ci failed")
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
        HookName::BeforeGitSync,
        spec.lifecycle_hooks.before_git_sync.as_deref(),
        &ctx,
        &env,
        &project_dir,
    )
    .await?;

    let mut args = vec!["diff".to_owned(), "--fail".to_owned()];
    args.extend(spec.stack_target());

    let output =
        ProcessRunner::run("GitSyncChecking", "cdk", &args, &project_dir, &env, DEFAULT_TIMEOUT).await?;

    // `cdk diff --fail` exits 0 when the synthesized template matches the deployed stack, and
    // non-zero when there is a difference (or the command itself failed to run).
    let changes_pending = output.exit_code != 0;

    if !changes_pending {
        metrics
            .gauge_set(GIT_SYNC_PENDING, 0.0, labels.clone(), GIT_SYNC_STATUS_GROUP)
            .await?;
        store
            .patch_status(namespace, name, Phase::Succeeded, "No Git changes pending")
            .await?;
        finish(store, obj, namespace, &ctx, &env, &project_dir, spec, false).await?;
        workspace.remove().await?;
        return Ok(());
    }

    metrics.counter_add(GIT_CHANGES_DETECTED_TOTAL, 1.0, labels.clone()).await?;
    metrics
        .gauge_set(GIT_SYNC_PENDING, 1.0, labels, GIT_SYNC_STATUS_GROUP)
        .await?;
    store
        .emit_event(
            namespace,
            obj,
            EventType::Normal,
            "GitChangesDetected",
            "Deployed template differs from the latest Git revision",
        )
        .await;

    if !(spec.actions.auto_redeploy && spec.actions.deploy) {
        store
            .patch_status(
                namespace,
                name,
                Phase::Succeeded,
                "Git changes pending; auto redeploy disabled",
            )
            .await?;
        finish(store, obj, namespace, &ctx, &env, &project_dir, spec, true).await?;
        workspace.remove().await?;
        return Ok(());
    }

    store
        .patch_status(namespace, name, Phase::Deploying, "Auto deploying from Git changes")
        .await?;
    store
        .emit_event(
            namespace,
            obj,
            EventType::Normal,
            "AutoRedeployStart",
            format!("Redeploying {} after Git changes were detected", display_target(spec)),
        )
        .await;

    let mut deploy_args = vec!["deploy".to_owned()];
    deploy_args.extend(spec.stack_target());
    deploy_args.push("--require-approval".to_owned());
    deploy_args.push("never".to_owned());
    deploy_args.extend(spec.context_args());

    let deploy_output = ProcessRunner::run(
        "Deploying",
        "cdk",
        &deploy_args,
        &project_dir,
        &env,
        CDK_DEPLOY_TIMEOUT,
    )
    .await?;

    if deploy_output.success() {
        store
            .patch_status_with(
                namespace,
                name,
                Phase::Succeeded,
                "Auto deployment from Git completed",
                |status| {
                    status.last_deploy = Some(chrono::Utc::now());
                },
            )
            .await?;
        store
            .emit_event(
                namespace,
                obj,
                EventType::Normal,
                "AutoRedeploySuccess",
                "Auto deployment from Git completed successfully",
            )
            .await;
    } else {
        warn!(namespace, name, exit_code = deploy_output.exit_code, "auto redeploy failed");
        store
            .patch_status(
                namespace,
                name,
                Phase::Succeeded,
                format!("{AUTO_REDEPLOY_FAILED_MARKER} (exit {})", deploy_output.exit_code),
            )
            .await?;
        store
            .emit_event(
                namespace,
                obj,
                EventType::Warning,
                "AutoRedeployFailure",
                "Auto deployment from Git changes failed; changes remain pending for manual deployment",
            )
            .await;
    }

    finish(store, obj, namespace, &ctx, &env, &project_dir, spec, true).await?;
    workspace.remove().await?;
    Ok(())
}

async fn finish(
    store: &ResourceStoreGateway,
    obj: &CdkTsStack,
    namespace: &str,
    ctx: &crate::hooks::HookContext<'_>,
    env: &std::collections::BTreeMap<String, String>,
    project_dir: &std::path::Path,
    spec: &crate::crd::CdkTsStackSpec,
    changes_detected: bool,
) -> Result<()> {
    let mut after_env = env.clone();
    after_env.insert("GIT_CHANGES_DETECTED".to_owned(), changes_detected.to_string());
    hook_runner::run(
        store,
        obj,
        namespace,
        HookName::AfterGitSync,
        spec.lifecycle_hooks.after_git_sync.as_deref(),
        ctx,
        &after_env,
        project_dir,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn marker_string_is_stable() {
        assert_eq!(
            AUTO_REDEPLOY_FAILED_MARKER,
            "Auto deployment failed - Git changes pending manual deployment"
        );
    }
}

use kube::runtime::events::EventType;
use tracing::{info, warn};

use crate::cdkstack::deploy::{display_target, hook_ctx};
use crate::cdkstack::hook_runner;
use crate::cdkstack::project;
use crate::credentials::AwsCredentials;
use crate::crd::CdkTsStack;
use crate::error::Result;
use crate::hooks::HookName;
use crate::process::{ProcessRunner, CDK_DEPLOY_TIMEOUT};
use crate::store::ResourceStoreGateway;
use crate::workspace::Workspace;

/// Single-shot destroy: not state-machined, because the object is leaving. Re-clones the repo,
/// runs `beforeDestroy`/`cdk destroy --force`/`afterDestroy`, and always cleans up its
/// workspace. Never returns an error for a failed `cdk destroy` itself, only for infrastructure
/// failures (credential load, Kubernetes errors): destroy failure must not block finalizer
/// removal, so the caller decides that regardless of this function's outcome.
pub async fn run(store: &ResourceStoreGateway, obj: &CdkTsStack, namespace: &str, name: &str) -> Result<()> {
    let spec = &obj.spec;
    let resource_key = format!("{namespace}.{name}");
    let workspace = Workspace::new("destroy", &resource_key).await?;

    let clone_output =
        project::clone_into(store.client().clone(), namespace, workspace.path(), spec).await?;
    if !clone_output.success() {
        warn!(namespace, name, "destroy: clone failed, nothing to destroy with");
        store
            .emit_event(
                namespace,
                obj,
                EventType::Warning,
                "StackDeployFailure",
                "Destroy skipped: unable to clone repository",
            )
            .await;
        return Ok(());
    }

    let project_dir = workspace.project_dir(&spec.path);
    if !project_dir.exists() {
        warn!(namespace, name, path = %spec.path, "destroy: spec.path missing in clone, skipping");
        return Ok(());
    }

    if let Some(output) = project::install_dependencies(&project_dir).await? {
        if !output.success() {
            warn!(namespace, name, "destroy: npm ci failed, attempting destroy anyway");
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
        HookName::BeforeDestroy,
        spec.lifecycle_hooks.before_destroy.as_deref(),
        &ctx,
        &env,
        &project_dir,
    )
    .await?;

    let mut args = vec!["destroy".to_owned(), "--force".to_owned()];
    args.extend(spec.stack_target());

    let output =
        ProcessRunner::run("Destroying", "cdk", &args, &project_dir, &env, CDK_DEPLOY_TIMEOUT).await?;

    if output.success() {
        info!(namespace, name, "destroy succeeded for {}", display_target(spec));
    } else {
        warn!(
            namespace,
            name,
            exit_code = output.exit_code,
            "cdk destroy failed; finalizer will still be removed"
        );
        store
            .emit_event(
                namespace,
                obj,
                EventType::Warning,
                "StackDeployFailure",
                format!("cdk destroy failed with exit code {}", output.exit_code),
            )
            .await;
    }

    hook_runner::run(
        store,
        obj,
        namespace,
        HookName::AfterDestroy,
        spec.lifecycle_hooks.after_destroy.as_deref(),
        &ctx,
        &env,
        &project_dir,
    )
    .await?;

    workspace.remove().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    // Scenario coverage for this workflow lives in `cdkstack::controller`'s mocked-apiserver
    // tests, since `run` needs a real Kubernetes client for credential loading.
}

use std::path::PathBuf;

use kube::runtime::events::EventType;
use tracing::info;

use crate::cdkstack::classify::classify_cdk_failure;
use crate::cdkstack::hook_runner;
use crate::cdkstack::project;
use crate::credentials::AwsCredentials;
use crate::crd::{CdkTsStack, CdkTsStackSpec, Phase};
use crate::error::Result;
use crate::hooks::{HookContext, HookName};
use crate::process::{ProcessRunner, CDK_DEPLOY_TIMEOUT};
use crate::store::ResourceStoreGateway;

/// The deploy state machine's workspace spans multiple reconciles (one per transition), unlike
/// the single-shot workflows, so it lives at a deterministic path instead of behind a
/// drop-on-scope-exit guard. Cleared at the start of `Cloning` and removed once `Deploying`
/// concludes either way.
fn workspace_path(namespace: &str, name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cdk-deploy-{namespace}.{name}"))
}

/// Runs exactly one transition of the deploy state machine (`""|Failed -> Cloning`,
/// `Cloning -> Installing`, `Installing -> Deploying`, `Deploying -> Succeeded|Failed`) for
/// `obj`, whose current phase is `current_phase`. Each `Modified` event advances one transition
/// so progress is observable externally and crash recovery resumes from `status.phase`.
pub async fn advance(
    store: &ResourceStoreGateway,
    obj: &CdkTsStack,
    namespace: &str,
    name: &str,
    current_phase: &Phase,
) -> Result<()> {
    let spec = &obj.spec;

    match current_phase {
        Phase::Empty | Phase::Failed => start_cloning(store, namespace, name).await,
        Phase::Cloning => run_clone(store, namespace, name, spec).await,
        Phase::Installing => run_install(store, namespace, name, spec).await,
        Phase::Deploying => run_deploy(store, obj, namespace, name, spec).await,
        _ => Ok(()),
    }
}

async fn start_cloning(store: &ResourceStoreGateway, namespace: &str, name: &str) -> Result<()> {
    let path = workspace_path(namespace, name);
    if path.exists() {
        tokio::fs::remove_dir_all(&path).await.ok();
    }
    tokio::fs::create_dir_all(&path).await?;
    store
        .patch_status(namespace, name, Phase::Cloning, "Cloning repository")
        .await
}

async fn run_clone(
    store: &ResourceStoreGateway,
    namespace: &str,
    name: &str,
    spec: &CdkTsStackSpec,
) -> Result<()> {
    let path = workspace_path(namespace, name);
    tokio::fs::create_dir_all(&path).await?;

    let output = project::clone_into(store.client().clone(), namespace, &path, spec).await?;
    if !output.success() {
        let truncated = tail(&output.output, 4000);
        tokio::fs::remove_dir_all(&path).await.ok();
        return store
            .patch_status(
                namespace,
                name,
                Phase::Failed,
                format!("Clone failed (exit {}): {truncated}", output.exit_code),
            )
            .await;
    }

    store
        .patch_status(namespace, name, Phase::Installing, "Installing dependencies")
        .await
}

async fn run_install(
    store: &ResourceStoreGateway,
    namespace: &str,
    name: &str,
    spec: &CdkTsStackSpec,
) -> Result<()> {
    let path = workspace_path(namespace, name);
    if !path.exists() {
        return recover_by_recloning(store, namespace, name).await;
    }

    let project_dir = path.join(spec.path.trim_start_matches("./"));
    if !project_dir.exists() {
        tokio::fs::remove_dir_all(&path).await.ok();
        return store
            .patch_status(
                namespace,
                name,
                Phase::Failed,
                format!("spec.path '{}' does not exist in the cloned repository", spec.path),
            )
            .await;
    }

    if let Some(output) = project::install_dependencies(&project_dir).await? {
        if !output.success() {
            let truncated = tail(&output.output, 4000);
            tokio::fs::remove_dir_all(&path).await.ok();
            return store
                .patch_status(
                    namespace,
                    name,
                    Phase::Failed,
                    format!("npm ci failed (exit {}): {truncated}", output.exit_code),
                )
                .await;
        }
    }

    store
        .patch_status(namespace, name, Phase::Deploying, "Deploying stack")
        .await
}

/// If the workspace vanished (e.g. the controller restarted between `Cloning` and
/// `Installing`), the simplest recovery is to fall back a state and re-clone rather than fail
/// the resource outright.
async fn recover_by_recloning(
    store: &ResourceStoreGateway,
    namespace: &str,
    name: &str,
) -> Result<()> {
    store
        .patch_status(namespace, name, Phase::Cloning, "Workspace missing, re-cloning")
        .await
}

async fn run_deploy(
    store: &ResourceStoreGateway,
    obj: &CdkTsStack,
    namespace: &str,
    name: &str,
    spec: &CdkTsStackSpec,
) -> Result<()> {
    let path = workspace_path(namespace, name);
    if !path.exists() {
        return recover_by_recloning(store, namespace, name).await;
    }
    let project_dir = path.join(spec.path.trim_start_matches("./"));

    let credentials =
        AwsCredentials::load(store.client().clone(), namespace, &spec.credentials_secret_name)
            .await?;
    let result = deploy_stack(store, obj, namespace, name, spec, &project_dir, &credentials).await;

    tokio::fs::remove_dir_all(&path).await.ok();

    result
}

async fn deploy_stack(
    store: &ResourceStoreGateway,
    obj: &CdkTsStack,
    namespace: &str,
    name: &str,
    spec: &CdkTsStackSpec,
    project_dir: &std::path::Path,
    credentials: &AwsCredentials,
) -> Result<()> {
    let mut env = credentials.env(&spec.aws_region);
    env.insert("CDK_DEFAULT_ACCOUNT".to_owned(), String::new());
    env.insert("AWS_ACCOUNT_ID".to_owned(), String::new());
    env.insert("AWS_ACCOUNT".to_owned(), String::new());
    env.insert("CDK_DEFAULT_REGION".to_owned(), spec.aws_region.clone());

    let ctx = hook_ctx(namespace, name, spec);
    hook_runner::run(
        store,
        obj,
        namespace,
        HookName::BeforeDeploy,
        spec.lifecycle_hooks.before_deploy.as_deref(),
        &ctx,
        &env,
        project_dir,
    )
    .await?;

    store
        .emit_event(
            namespace,
            obj,
            EventType::Normal,
            "StackDeployStart",
            format!("Deploying {}", display_target(spec)),
        )
        .await;

    let mut args = vec!["deploy".to_owned()];
    args.extend(spec.stack_target());
    args.push("--require-approval".to_owned());
    args.push("never".to_owned());
    args.extend(spec.context_args());

    let output =
        ProcessRunner::run("Deploying", "cdk", &args, project_dir, &env, CDK_DEPLOY_TIMEOUT).await?;

    if output.success() {
        hook_runner::run(
            store,
            obj,
            namespace,
            HookName::AfterDeploy,
            spec.lifecycle_hooks.after_deploy.as_deref(),
            &ctx,
            &env,
            project_dir,
        )
        .await?;
        store
            .patch_status_with(namespace, name, Phase::Succeeded, "Deploy completed", |status| {
                status.last_deploy = Some(chrono::Utc::now());
            })
            .await?;
        store
            .emit_event(
                namespace,
                obj,
                EventType::Normal,
                "StackDeploySuccess",
                "cdk deploy completed successfully",
            )
            .await;
        info!(namespace, name, "deploy succeeded");
    } else {
        let summary = classify_cdk_failure(&output.output, output.exit_code);
        store
            .patch_status(namespace, name, Phase::Failed, summary.clone())
            .await?;
        store
            .emit_event(namespace, obj, EventType::Warning, "StackDeployFailure", summary)
            .await;
    }

    Ok(())
}

pub(crate) fn hook_ctx<'a>(
    namespace: &'a str,
    name: &'a str,
    spec: &'a CdkTsStackSpec,
) -> HookContext<'a> {
    HookContext {
        stack_name: &spec.stack_name,
        namespace,
        resource_name: name,
        region: &spec.aws_region,
        project_path: &spec.path,
        git_repository: &spec.source.git.repository,
        git_ref: spec.git_ref(),
    }
}

pub(crate) fn display_target(spec: &CdkTsStackSpec) -> String {
    if spec.stack_name.is_empty() {
        "all stacks".to_owned()
    } else {
        spec.stack_name.clone()
    }
}

/// The last `max_chars` characters of `s`, so a status message never carries megabytes of CDK
/// output.
pub(crate) fn tail(s: &str, max_chars: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_chars {
        s.to_owned()
    } else {
        chars[chars.len() - max_chars..].iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_target_falls_back_to_all_stacks() {
        let spec = CdkTsStackSpec::default();
        assert_eq!(display_target(&spec), "all stacks");
    }

    #[test]
    fn display_target_uses_stack_name_when_set() {
        let spec = CdkTsStackSpec {
            stack_name: "MyStack".to_owned(),
            ..Default::default()
        };
        assert_eq!(display_target(&spec), "MyStack");
    }

    #[test]
    fn tail_truncates_long_output() {
        let s = "a".repeat(100);
        assert_eq!(tail(&s, 10).len(), 10);
    }

    #[test]
    fn tail_leaves_short_output_alone() {
        assert_eq!(tail("short", 10), "short");
    }
}

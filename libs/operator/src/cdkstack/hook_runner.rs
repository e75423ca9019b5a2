use std::collections::BTreeMap;
use std::path::Path;

use kube::runtime::events::EventType;

use crate::crd::CdkTsStack;
use crate::error::Result;
use crate::hooks::{HookContext, HookName, HookOutcome, LifecycleHookExecutor};
use crate::store::ResourceStoreGateway;

/// Runs a lifecycle hook and mirrors its outcome onto the resource's event stream:
/// `LifecycleHookStart` when a script actually runs, then either `LifecycleHookSuccess` or the
/// non-fatal `LifecycleHookFailure` warning. A missing `script` runs nothing and emits nothing.
pub async fn run(
    store: &ResourceStoreGateway,
    obj: &CdkTsStack,
    namespace: &str,
    hook: HookName,
    script: Option<&str>,
    ctx: &HookContext<'_>,
    env: &BTreeMap<String, String>,
    workdir: &Path,
) -> Result<HookOutcome> {
    if script.is_none() {
        return LifecycleHookExecutor::run(hook, script, ctx, env, workdir).await;
    }

    store
        .emit_event(
            namespace,
            obj,
            EventType::Normal,
            "LifecycleHookStart",
            format!("Running {} hook", hook.as_str()),
        )
        .await;

    let outcome = LifecycleHookExecutor::run(hook, script, ctx, env, workdir).await?;

    if outcome.failed() {
        store
            .emit_event(
                namespace,
                obj,
                EventType::Warning,
                "LifecycleHookFailure",
                format!(
                    "{} hook exited with code {}",
                    hook.as_str(),
                    outcome.output.exit_code
                ),
            )
            .await;
    } else {
        store
            .emit_event(
                namespace,
                obj,
                EventType::Normal,
                "LifecycleHookSuccess",
                format!("{} hook completed", hook.as_str()),
            )
            .await;
    }

    Ok(outcome)
}

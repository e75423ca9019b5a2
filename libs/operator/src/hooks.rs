use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::Result;
use crate::process::ProcessRunner;

/// The eight named stages a lifecycle hook can run at, mirroring `spec.lifecycleHooks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookName {
    BeforeDeploy,
    AfterDeploy,
    BeforeDestroy,
    AfterDestroy,
    BeforeDriftDetection,
    AfterDriftDetection,
    BeforeGitSync,
    AfterGitSync,
}

impl HookName {
    pub fn as_str(self) -> &'static str {
        match self {
            HookName::BeforeDeploy => "beforeDeploy",
            HookName::AfterDeploy => "afterDeploy",
            HookName::BeforeDestroy => "beforeDestroy",
            HookName::AfterDestroy => "afterDestroy",
            HookName::BeforeDriftDetection => "beforeDriftDetection",
            HookName::AfterDriftDetection => "afterDriftDetection",
            HookName::BeforeGitSync => "beforeGitSync",
            HookName::AfterGitSync => "afterGitSync",
        }
    }
}

/// Fixed context copied verbatim into every hook's environment, independent of which hook is
/// running.
pub struct HookContext<'a> {
    pub stack_name: &'a str,
    pub namespace: &'a str,
    pub resource_name: &'a str,
    pub region: &'a str,
    pub project_path: &'a str,
    pub git_repository: &'a str,
    pub git_ref: &'a str,
}

/// Outcome of running a hook: non-zero is reported to the caller but is never treated as fatal
/// by itself, per the documented failure policy.
pub struct HookOutcome {
    pub ran: bool,
    pub output: ProcessOutputSummary,
}

pub struct ProcessOutputSummary {
    pub exit_code: i32,
    pub output: String,
}

impl HookOutcome {
    pub fn failed(&self) -> bool {
        self.ran && self.output.exit_code != 0
    }
}

const HOOK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Synthesizes and runs a user-supplied hook script body under `bash -e -u -o pipefail`, with
/// the documented environment contract always exported. `pipefail` is a bash/ksh/zsh extension,
/// not POSIX `sh` (dash/ash abort on it), so the script is always run through `bash` explicitly
/// rather than the system `sh`.
pub struct LifecycleHookExecutor;

impl LifecycleHookExecutor {
    /// Runs `script` (if present) for `hook` inside `workdir`, with `env` (credentials + any
    /// hook-specific variables like `DRIFT_DETECTED`) overlaid on top of [`HookContext`].
    /// Returns `ran = false` without spawning anything when `script` is `None`.
    pub async fn run(
        hook: HookName,
        script: Option<&str>,
        ctx: &HookContext<'_>,
        extra_env: &BTreeMap<String, String>,
        workdir: &std::path::Path,
    ) -> Result<HookOutcome> {
        let Some(body) = script else {
            return Ok(HookOutcome {
                ran: false,
                output: ProcessOutputSummary {
                    exit_code: 0,
                    output: String::new(),
                },
            });
        };

        let script_file = tempfile::Builder::new()
            .prefix("cdk-hook-")
            .suffix(".sh")
            .tempfile_in(workdir)
            .map_err(crate::error::Error::IoError)?;
        let (mut file, path) = script_file.keep().map_err(|e| e.error)?;
        let script_body = format!("#!/bin/bash\nset -e -u -o pipefail\n{body}\n");
        file.write_all(script_body.as_bytes()).await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&path).await?.permissions();
            perms.set_mode(0o700);
            tokio::fs::set_permissions(&path, perms).await?;
        }

        let mut env = extra_env.clone();
        env.insert("CDK_STACK_NAME".to_owned(), ctx.stack_name.to_owned());
        env.insert(
            "CDK_STACK_NAMESPACE".to_owned(),
            ctx.namespace.to_owned(),
        );
        env.insert(
            "CDK_STACK_RESOURCE_NAME".to_owned(),
            ctx.resource_name.to_owned(),
        );
        env.insert("CDK_STACK_REGION".to_owned(), ctx.region.to_owned());
        env.insert("CDK_OPERATION".to_owned(), hook.as_str().to_owned());
        env.insert("CDK_PROJECT_PATH".to_owned(), ctx.project_path.to_owned());
        env.insert(
            "CDK_GIT_REPOSITORY".to_owned(),
            ctx.git_repository.to_owned(),
        );
        env.insert("CDK_GIT_REF".to_owned(), ctx.git_ref.to_owned());

        let result = ProcessRunner::run(
            hook.as_str(),
            "bash",
            &[path.to_string_lossy().into_owned()],
            workdir,
            &env,
            HOOK_TIMEOUT,
        )
        .await?;

        let _ = tokio::fs::remove_file(&path).await;

        if result.exit_code != 0 {
            warn!(hook = hook.as_str(), exit_code = result.exit_code, "lifecycle hook failed");
        }

        Ok(HookOutcome {
            ran: true,
            output: ProcessOutputSummary {
                exit_code: result.exit_code,
                output: result.output,
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx() -> HookContext<'static> {
        HookContext {
            stack_name: "MyStack",
            namespace: "default",
            resource_name: "my-stack",
            region: "us-east-1",
            project_path: ".",
            git_repository: "https://example.com/repo.git",
            git_ref: "main",
        }
    }

    #[tokio::test]
    async fn missing_script_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = LifecycleHookExecutor::run(
            HookName::BeforeDeploy,
            None,
            &ctx(),
            &BTreeMap::new(),
            dir.path(),
        )
        .await
        .unwrap();
        assert!(!outcome.ran);
        assert!(!outcome.failed());
    }

    #[tokio::test]
    async fn successful_script_reports_ran_and_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = LifecycleHookExecutor::run(
            HookName::AfterDeploy,
            Some("echo \"stack=$CDK_STACK_NAME\""),
            &ctx(),
            &BTreeMap::new(),
            dir.path(),
        )
        .await
        .unwrap();
        assert!(outcome.ran);
        assert!(!outcome.failed());
        assert!(outcome.output.output.contains("stack=MyStack"));
    }

    #[tokio::test]
    async fn failing_script_is_reported_but_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = LifecycleHookExecutor::run(
            HookName::BeforeDestroy,
            Some("exit 7"),
            &ctx(),
            &BTreeMap::new(),
            dir.path(),
        )
        .await
        .unwrap();
        assert!(outcome.ran);
        assert!(outcome.failed());
        assert_eq!(outcome.output.exit_code, 7);
    }
}

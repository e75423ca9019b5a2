use std::collections::BTreeMap;
use std::time::Duration;

use kube::Client;

use crate::cdkstack::ssh::GitSshKey;
use crate::crd::CdkTsStackSpec;
use crate::error::Result;
use crate::process::{ProcessOutput, ProcessRunner, DEFAULT_TIMEOUT};

const CLONE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const INSTALL_TIMEOUT: Duration = DEFAULT_TIMEOUT;

/// `git clone --depth 1 --branch <ref> <url> <dest>`, with a stable Git identity set first so
/// hooks that shell out to `git` inside the clone don't fail on an unset author. When
/// `spec.source.git.sshSecretName` is set, materializes that key for the duration of the clone
/// and points `GIT_SSH_COMMAND` at it.
pub async fn clone_into(
    client: Client,
    namespace: &str,
    dest: &std::path::Path,
    spec: &CdkTsStackSpec,
) -> Result<ProcessOutput> {
    let mut env = BTreeMap::from([
        ("GIT_AUTHOR_NAME".to_owned(), "cdkts-operator".to_owned()),
        ("GIT_AUTHOR_EMAIL".to_owned(), "cdkts-operator@localhost".to_owned()),
        ("GIT_COMMITTER_NAME".to_owned(), "cdkts-operator".to_owned()),
        ("GIT_COMMITTER_EMAIL".to_owned(), "cdkts-operator@localhost".to_owned()),
    ]);

    let _ssh_key = match spec.source.git.ssh_secret_name.as_deref() {
        Some(secret_name) => {
            let key = GitSshKey::load(client, namespace, secret_name).await?;
            env.insert("GIT_SSH_COMMAND".to_owned(), key.ssh_command());
            Some(key)
        }
        None => None,
    };

    let args = vec![
        "clone".to_owned(),
        "--depth".to_owned(),
        "1".to_owned(),
        "--branch".to_owned(),
        spec.git_ref().to_owned(),
        spec.source.git.repository.clone(),
        ".".to_owned(),
    ];

    ProcessRunner::run("Cloning", "git", &args, dest, &env, CLONE_TIMEOUT).await
}

/// Runs `npm ci --no-audit --no-fund` inside `project_dir` if it contains a `package.json`.
/// Returns `None` when there is nothing to install, matching the "or no package.json" clause
/// of the Installing transition.
pub async fn install_dependencies(
    project_dir: &std::path::Path,
) -> Result<Option<ProcessOutput>> {
    if !project_dir.join("package.json").exists() {
        return Ok(None);
    }
    let env = BTreeMap::new();
    let out = ProcessRunner::run(
        "Installing",
        "npm",
        &[
            "ci".to_owned(),
            "--no-audit".to_owned(),
            "--no-fund".to_owned(),
        ],
        project_dir,
        &env,
        INSTALL_TIMEOUT,
    )
    .await?;
    Ok(Some(out))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn install_dependencies_skips_without_package_json() {
        let dir = tempfile::tempdir().unwrap();
        let result = install_dependencies(dir.path()).await.unwrap();
        assert!(result.is_none());
    }
}

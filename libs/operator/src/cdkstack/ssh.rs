use std::path::PathBuf;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

const SSH_PRIVATE_KEY_KEY: &str = "ssh-privatekey";

/// A private key materialized from `spec.source.git.sshSecretName` for the duration of a single
/// clone. The key file lives outside the clone destination (cloning into a non-empty directory
/// fails) and is removed when this guard drops, win or lose.
pub struct GitSshKey {
    key_path: PathBuf,
}

impl GitSshKey {
    /// Reads the `kubernetes.io/ssh-auth` secret named `secret_name` and writes its
    /// `ssh-privatekey` entry to a `0600` file in the system temp directory.
    pub async fn load(client: Client, namespace: &str, secret_name: &str) -> Result<Self> {
        let api: Api<Secret> = Api::namespaced(client, namespace);
        let secret = match api.get(secret_name).await {
            Ok(s) => s,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::ConfigError(format!(
                    "ssh secret {namespace}/{secret_name} not found"
                )))
            }
            Err(e) => return Err(Error::KubeError(e)),
        };

        let data = secret.data.unwrap_or_default();
        let key_bytes = data.get(SSH_PRIVATE_KEY_KEY).ok_or_else(|| {
            Error::ConfigError(format!(
                "ssh secret {namespace}/{secret_name} is missing key {SSH_PRIVATE_KEY_KEY}"
            ))
        })?;

        let key_path = std::env::temp_dir().join(format!(
            "cdk-ssh-{namespace}.{secret_name}-{}",
            uuid::Uuid::new_v4()
        ));
        let mut file = tokio::fs::File::create(&key_path).await?;
        file.write_all(&key_bytes.0).await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&key_path).await?.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&key_path, perms).await?;
        }

        Ok(Self { key_path })
    }

    /// The `GIT_SSH_COMMAND` value that makes `git` authenticate with this key. Host key
    /// checking is disabled: the controller has no mechanism to pre-seed `known_hosts` for an
    /// arbitrary user-supplied Git host.
    pub fn ssh_command(&self) -> String {
        format!(
            "ssh -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            self.key_path.display()
        )
    }
}

impl Drop for GitSshKey {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.key_path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ssh_command_references_key_path() {
        let key = GitSshKey {
            key_path: PathBuf::from("/tmp/cdk-ssh-test"),
        };
        let command = key.ssh_command();
        assert!(command.contains("/tmp/cdk-ssh-test"));
        assert!(command.contains("StrictHostKeyChecking=no"));
    }
}

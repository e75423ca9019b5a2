use std::path::{Path, PathBuf};

use crate::error::Result;

/// An ephemeral per-operation directory, `/tmp/cdk-{kind}-{resource}-{unique}`, owned
/// exclusively by the operation that created it. Removed on drop regardless of how the
/// operation exited, so a panic or early return never leaks a workspace.
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Creates a fresh, empty workspace directory. `kind` names the operation (`deploy`,
    /// `destroy`, `drift`, `git-sync`); `resource` is `namespace.name`.
    pub async fn new(kind: &str, resource: &str) -> Result<Self> {
        let unique = uuid::Uuid::new_v4();
        let path = std::env::temp_dir().join(format!("cdk-{kind}-{resource}-{unique}"));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory holding the CDK project, `path` joined with `spec.path`.
    pub fn project_dir(&self, spec_path: &str) -> PathBuf {
        self.path.join(spec_path.trim_start_matches("./"))
    }

    /// Explicit, awaitable removal for call sites that want to observe I/O errors instead of
    /// silently logging them from `Drop`.
    pub async fn remove(self) -> Result<()> {
        let path = self.path.clone();
        std::mem::forget(self);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove workspace on drop");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn new_workspace_directory_exists() {
        let ws = Workspace::new("deploy", "default.my-stack").await.unwrap();
        assert!(ws.path().exists());
        let path = ws.path().to_path_buf();
        ws.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_directory() {
        let path = {
            let ws = Workspace::new("destroy", "default.my-stack").await.unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn project_dir_strips_leading_dot_slash() {
        let ws = Workspace::new("deploy", "default.x").await.unwrap();
        let dir = ws.project_dir("./infra");
        assert_eq!(dir, ws.path().join("infra"));
    }
}

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::engine::{config::WorkspaceConfig, error::ExecutionError};

/// Allocates per-job directories under two bases that name the same storage:
/// one as this process sees it, one as the sandbox daemon sees it.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    local_base: PathBuf,
    host_base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            local_base: config.local_base.clone(),
            host_base: config.host_base.clone(),
        }
    }

    pub async fn create(&self) -> Result<Workspace, ExecutionError> {
        self.create_with_id(Uuid::new_v4().to_string()).await
    }

    pub async fn create_with_id(&self, id: String) -> Result<Workspace, ExecutionError> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(ExecutionError::workspace_io(
                self.local_base.clone(),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid workspace id {id:?}"),
                ),
            ));
        }

        let local_path = self.local_base.join(&id);
        tokio::fs::create_dir_all(&self.local_base)
            .await
            .map_err(|e| ExecutionError::workspace_io(&self.local_base, e))?;
        // create_dir (not create_dir_all) so an existing directory is never reused
        tokio::fs::create_dir(&local_path)
            .await
            .map_err(|e| ExecutionError::workspace_io(&local_path, e))?;

        tracing::debug!(workspace_id = %id, path = %local_path.display(), "workspace created");
        Ok(Workspace {
            host_path: self.host_base.join(&id),
            local_path,
            id,
            released: false,
        })
    }
}

/// Owned per-job directory. Removed by [`Workspace::destroy`], or on drop if
/// that never ran.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    host_path: PathBuf,
    local_path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Writes `code` to `local_path/file_name` and syncs it to disk before
    /// returning.
    pub async fn write_source(&self, file_name: &str, code: &str) -> Result<PathBuf, ExecutionError> {
        let path = self.local_path.join(file_name);
        let io_err = |e| ExecutionError::workspace_io(&path, e);

        let mut file = tokio::fs::File::create(&path).await.map_err(io_err)?;
        file.write_all(code.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        Ok(path)
    }

    pub async fn destroy(mut self) {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.local_path).await {
            Ok(()) => tracing::debug!(workspace_id = %self.id, "workspace removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                workspace_id = %self.id,
                path = %self.local_path.display(),
                error = %err,
                "failed to remove workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.local_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(workspace_id = %self.id, error = %err, "failed to remove workspace on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkspaceManager;
    use crate::engine::{config::WorkspaceConfig, error::ExecutionError};

    fn manager(dir: &tempfile::TempDir) -> WorkspaceManager {
        WorkspaceManager::new(&WorkspaceConfig {
            local_base: dir.path().join("local"),
            host_base: "/host/tmp".into(),
        })
    }

    #[tokio::test]
    async fn paths_share_the_same_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = manager(&dir).create().await.expect("workspace");

        assert!(workspace.local_path().is_dir());
        assert!(workspace.local_path().ends_with(workspace.id()));
        assert_eq!(
            workspace.host_path(),
            std::path::Path::new("/host/tmp").join(workspace.id())
        );
        workspace.destroy().await;
    }

    #[tokio::test]
    async fn writes_source_durably_and_destroys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = manager(&dir).create().await.expect("workspace");

        let path = workspace
            .write_source("script.py", "print(\"hi\")\n")
            .await
            .expect("write");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "print(\"hi\")\n");

        let local = workspace.local_path().to_path_buf();
        workspace.destroy().await;
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn drop_removes_unreleased_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = manager(&dir).create().await.expect("workspace");
        let local = workspace.local_path().to_path_buf();
        drop(workspace);
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        let a = manager.create().await.expect("a");
        let b = manager.create().await.expect("b");
        assert_ne!(a.id(), b.id());
        assert_ne!(a.local_path(), b.local_path());
    }

    #[tokio::test]
    async fn existing_directory_is_not_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(&dir);
        let first = manager.create_with_id("fixed".into()).await.expect("first");
        let err = manager.create_with_id("fixed".into()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::WorkspaceIo { .. }));
        first.destroy().await;
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = manager(&dir).create_with_id("../escape".into()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::WorkspaceIo { .. }));
    }

    #[tokio::test]
    async fn unwritable_base_is_a_workspace_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").expect("write");
        let manager = WorkspaceManager::new(&WorkspaceConfig {
            local_base: blocker.join("nested"),
            host_base: "/host/tmp".into(),
        });
        assert!(matches!(
            manager.create().await,
            Err(ExecutionError::WorkspaceIo { .. })
        ));
    }
}

mod docker;
mod language;
mod orchestrator;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use docker::DockerRuntime;
pub use language::{LanguageRegistry, LanguageSpec};
pub use orchestrator::Orchestrator;

/// Combined stdout/stderr of a sandbox process, in arrival order.
pub type OutputStream = BoxStream<'static, anyhow::Result<Bytes>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub network_disabled: bool,
    /// Let the daemon delete the container once it exits on its own.
    pub auto_remove: bool,
    pub mount: BindMount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Container lifecycle operations of an external sandbox daemon.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String>;
    /// Must be usable before `start` so no early output is missed.
    async fn attach(&self, id: &str) -> anyhow::Result<OutputStream>;
    async fn start(&self, id: &str) -> anyhow::Result<()>;
    /// Resolves with the exit code. Called before `start`, since an
    /// auto-removed container may be gone soon after it exits.
    async fn wait(&self, id: &str) -> anyhow::Result<i64>;
    /// Kills the container if it is still running, then deletes it and its
    /// writable layer.
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}

/// Ensures a created container is removed exactly once, even when the
/// owning future errors out or is dropped.
pub(crate) struct ContainerGuard {
    runtime: Arc<dyn SandboxRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    pub(crate) fn new(runtime: Arc<dyn SandboxRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    pub(crate) fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub(crate) async fn release(mut self) {
        if let Some(id) = self.id.take() {
            remove_logged(self.runtime.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_logged(runtime.as_ref(), &id).await });
            }
            Err(_) => tracing::error!(container_id = %id, "no runtime to remove container"),
        }
    }
}

async fn remove_logged(runtime: &dyn SandboxRuntime, id: &str) {
    match runtime.remove(id).await {
        Ok(()) => tracing::debug!(container_id = %id, "container removed"),
        Err(err) => {
            tracing::warn!(container_id = %id, error = %err, "failed to remove container")
        }
    }
}

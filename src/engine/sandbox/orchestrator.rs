use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::engine::{
    config::SandboxConfig,
    error::ExecutionError,
    models::{ExecutionLimits, ExecutionOutcome},
    sandbox::{BindMount, ContainerGuard, ContainerSpec, LanguageSpec, OutputStream, SandboxRuntime},
    workspace::Workspace,
};

/// How long the output stream may keep running after the process exited or
/// was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Runs one source file in a fresh, resource-limited container.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn SandboxRuntime>,
    workdir: String,
    limits: ExecutionLimits,
}

struct Captured {
    bytes: BytesMut,
    truncated: bool,
    error: Option<String>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: &SandboxConfig) -> Self {
        Self {
            runtime,
            workdir: config.workdir.clone(),
            limits: config.limits.clone(),
        }
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn container_spec(&self, language: &LanguageSpec, workspace: &Workspace) -> ContainerSpec {
        let source_path = format!(
            "{}/{}",
            self.workdir.trim_end_matches('/'),
            language.source_file_name
        );
        ContainerSpec {
            name: format!("sandbox-{}", workspace.id()),
            image: language.image.clone(),
            cmd: language.command_for(&source_path),
            working_dir: self.workdir.clone(),
            memory_bytes: self.limits.memory_bytes(),
            nano_cpus: self.limits.nano_cpus(),
            pids_limit: self.limits.max_processes as i64,
            network_disabled: true,
            auto_remove: true,
            mount: BindMount {
                source: workspace.host_path().to_string_lossy().into_owned(),
                target: self.workdir.clone(),
                read_only: false,
            },
        }
    }

    /// Launches the container, captures its combined output and waits up to
    /// `timeout` for it to exit. The container is gone when this returns.
    pub async fn run(
        &self,
        language: &LanguageSpec,
        workspace: &Workspace,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let spec = self.container_spec(language, workspace);
        let id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| ExecutionError::ContainerLaunch(format!("{e:#}")))?;
        let guard = ContainerGuard::new(self.runtime.clone(), id);
        tracing::debug!(container_id = %guard.id(), image = %spec.image, "container created");

        let result = self.supervise(&guard, timeout).await;
        guard.release().await;
        result
    }

    async fn supervise(
        &self,
        guard: &ContainerGuard,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let stream = self
            .runtime
            .attach(guard.id())
            .await
            .map_err(|e| ExecutionError::Stream {
                message: format!("{e:#}"),
                partial_output: Vec::new(),
            })?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let mut collector = tokio::spawn(collect_output(
            stream,
            self.limits.max_output_bytes,
            stop_rx,
        ));

        let runtime = self.runtime.clone();
        let id = guard.id().to_string();
        let mut exit = tokio::spawn(async move { runtime.wait(&id).await });

        let started = Instant::now();
        if let Err(err) = self.runtime.start(guard.id()).await {
            exit.abort();
            collector.abort();
            return Err(ExecutionError::ContainerLaunch(format!("{err:#}")));
        }

        let waited = tokio::time::timeout(timeout, &mut exit).await;
        let (exit_code, timed_out) = match waited {
            Ok(Ok(Ok(code))) => (code, false),
            Ok(Ok(Err(err))) => {
                let captured = finish_collecting(&mut collector, stop_tx).await;
                return Err(ExecutionError::Stream {
                    message: format!("{err:#}"),
                    partial_output: captured.bytes.to_vec(),
                });
            }
            Ok(Err(join_err)) => {
                let captured = finish_collecting(&mut collector, stop_tx).await;
                return Err(ExecutionError::Stream {
                    message: format!("exit watcher failed: {join_err}"),
                    partial_output: captured.bytes.to_vec(),
                });
            }
            Err(_) => {
                exit.abort();
                tracing::warn!(
                    container_id = %guard.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "sandbox timed out, killing container"
                );
                if let Err(err) = self.runtime.remove(guard.id()).await {
                    tracing::warn!(container_id = %guard.id(), error = %err, "forced removal failed");
                }
                (-1, true)
            }
        };

        let captured = finish_collecting(&mut collector, stop_tx).await;
        let duration_ms = started.elapsed().as_millis();
        if let Some(message) = captured.error {
            if !timed_out {
                return Err(ExecutionError::Stream {
                    message,
                    partial_output: captured.bytes.to_vec(),
                });
            }
        }

        Ok(ExecutionOutcome {
            exit_code,
            captured_output: captured.bytes.to_vec(),
            timed_out,
            truncated: captured.truncated,
            duration_ms,
        })
    }
}

/// Waits a bounded time for the stream to end on its own, then stops the
/// collector and returns whatever it gathered.
async fn finish_collecting(
    collector: &mut JoinHandle<Captured>,
    stop: oneshot::Sender<()>,
) -> Captured {
    if let Ok(joined) = tokio::time::timeout(DRAIN_GRACE, &mut *collector).await {
        return joined.unwrap_or_else(join_failure);
    }
    let _ = stop.send(());
    collector.await.unwrap_or_else(join_failure)
}

fn join_failure(err: tokio::task::JoinError) -> Captured {
    Captured {
        bytes: BytesMut::new(),
        truncated: false,
        error: Some(format!("output collector failed: {err}")),
    }
}

async fn collect_output(
    mut stream: OutputStream,
    limit: usize,
    mut stop: oneshot::Receiver<()>,
) -> Captured {
    let mut captured = Captured {
        bytes: BytesMut::with_capacity(limit.min(8192)),
        truncated: false,
        error: None,
    };
    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => {
                    let remaining = limit.saturating_sub(captured.bytes.len());
                    if chunk.len() > remaining {
                        captured.truncated = true;
                    }
                    captured.bytes.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
                }
                Some(Err(err)) => {
                    captured.error = Some(format!("{err:#}"));
                    break;
                }
                None => break,
            },
            _ = &mut stop => break,
        }
    }
    captured
}

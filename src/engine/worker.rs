use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio::sync::watch;

use crate::engine::{
    error::{ExecutionError, PayloadError, StoreError},
    metrics::WorkerMetrics,
    models::{ExecutionOutcome, Job, JobStatus},
    queue::JobQueue,
    sandbox::{LanguageRegistry, LanguageSpec, Orchestrator},
    sanitize::sanitize,
    store::{StatusReporter, StatusStore},
    workspace::WorkspaceManager,
};

const TRUNCATION_NOTICE: &str = "[output truncated]";

/// Pulls jobs one at a time and drives each through the sandbox.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    reporter: StatusReporter,
    registry: LanguageRegistry,
    workspaces: WorkspaceManager,
    orchestrator: Orchestrator,
    metrics: Arc<WorkerMetrics>,
    poll: Duration,
    backoff: Duration,
}

/// Terminal status and output of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: JobStatus,
    pub output: String,
    pub exit_code: Option<i64>,
    pub failure: Option<&'static str>,
}

impl Verdict {
    pub fn from_result(result: Result<ExecutionOutcome, ExecutionError>, timeout_ms: u64) -> Self {
        let (err, truncated) = match result {
            Ok(outcome) if outcome.timed_out => (
                ExecutionError::TimeoutExceeded {
                    timeout_ms,
                    partial_output: outcome.captured_output,
                },
                outcome.truncated,
            ),
            Ok(outcome) if outcome.exit_code == 0 => {
                return Self {
                    status: JobStatus::Completed,
                    output: mark_truncated(sanitize(&outcome.output_lossy()), outcome.truncated),
                    exit_code: Some(0),
                    failure: None,
                };
            }
            Ok(outcome) => (
                ExecutionError::NonZeroExit {
                    exit_code: outcome.exit_code,
                    output: outcome.captured_output,
                },
                outcome.truncated,
            ),
            Err(err) => (err, false),
        };

        let output = match err {
            ExecutionError::NonZeroExit { .. } | ExecutionError::TimeoutExceeded { .. } => {
                mark_truncated(err.status_message(), truncated)
            }
            _ => err.status_message(),
        };
        Self {
            status: JobStatus::Error,
            output,
            exit_code: err.exit_code(),
            failure: Some(err.kind()),
        }
    }
}

fn mark_truncated(output: String, truncated: bool) -> String {
    match (truncated, output.is_empty()) {
        (false, _) => output,
        (true, true) => TRUNCATION_NOTICE.to_string(),
        (true, false) => format!("{output}\n{TRUNCATION_NOTICE}"),
    }
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn StatusStore>,
        registry: LanguageRegistry,
        workspaces: WorkspaceManager,
        orchestrator: Orchestrator,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            queue,
            reporter: StatusReporter::new(store),
            registry,
            workspaces,
            orchestrator,
            metrics,
            poll: Duration::from_secs(5),
            backoff: Duration::from_secs(1),
        }
    }

    pub fn with_polling(mut self, poll: Duration, backoff: Duration) -> Self {
        self.poll = poll;
        self.backoff = backoff;
        self
    }

    /// Runs until `shutdown` flips to `true`. A pop is never cancelled
    /// mid-flight, so a job handed over by the broker is always processed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            runtime = self.orchestrator.runtime_name(),
            languages = ?self.registry.languages().collect::<Vec<_>>(),
            "worker waiting for jobs"
        );

        while !*shutdown.borrow() {
            match self.queue.pop(self.poll).await {
                Ok(Some(payload)) => {
                    self.metrics.dequeued();
                    self.handle_payload(&payload).await;
                    tracing::debug!(metrics = ?self.metrics.snapshot(), "job handled");
                }
                Ok(None) => {}
                Err(err) => {
                    self.metrics.dequeue_error();
                    tracing::error!(
                        error = %format!("{err:#}"),
                        backoff_ms = self.backoff.as_millis() as u64,
                        "dequeue failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!(metrics = ?self.metrics.snapshot(), "worker stopped");
    }

    /// Decodes and processes one raw payload. Never fails; every problem ends
    /// up in the status store or the log.
    pub async fn handle_payload(&self, raw: &str) {
        let job = match Job::from_payload(raw) {
            Ok(job) => job,
            Err(err) => {
                self.metrics.malformed();
                match &err {
                    PayloadError::Identified { job_id, .. } => {
                        tracing::warn!(job_id = %job_id, error = %err, "malformed job payload");
                        let reported = self.reporter.set_error(job_id, err.to_string(), None).await;
                        if let Err(store_err) = reported {
                            tracing::error!(job_id = %job_id, error = %store_err, "failed to report malformed job");
                        }
                    }
                    PayloadError::Anonymous(_) => {
                        tracing::error!(error = %err, "dropping job payload without a job id");
                    }
                }
                return;
            }
        };

        match AssertUnwindSafe(self.process_job(&job)).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::error!(job_id = %job.job_id, error = %err, "status store write failed");
            }
            Err(_) => {
                self.metrics.failed();
                tracing::error!(job_id = %job.job_id, "job processing panicked");
                let reported = self
                    .reporter
                    .set_error(&job.job_id, "Internal worker error.".to_string(), None)
                    .await;
                if let Err(store_err) = reported {
                    tracing::error!(job_id = %job.job_id, error = %store_err, "failed to report panicked job");
                }
            }
        }
    }

    /// Pending → Running → Completed | Error, or Pending → Error for an
    /// unsupported language.
    pub async fn process_job(&self, job: &Job) -> Result<Verdict, StoreError> {
        tracing::info!(job_id = %job.job_id, language = %job.language, "processing job");

        let language = match self.registry.lookup(&job.language) {
            Ok(language) => language,
            Err(err) => {
                self.metrics.rejected();
                tracing::warn!(job_id = %job.job_id, language = %job.language, "unsupported language");
                let verdict = Verdict::from_result(Err(err), 0);
                self.reporter
                    .set_error(&job.job_id, verdict.output.clone(), None)
                    .await?;
                return Ok(verdict);
            }
        };

        self.reporter.set_running(&job.job_id).await?;
        self.metrics.started();

        let timeout_ms = self.orchestrator.limits().timeout_ms;
        let verdict = Verdict::from_result(self.execute(job, language).await, timeout_ms);

        match verdict.status {
            JobStatus::Completed => {
                self.metrics.completed();
                tracing::info!(job_id = %job.job_id, exit_code = ?verdict.exit_code, "job completed");
                self.reporter
                    .set_completed(&job.job_id, verdict.output.clone(), 0)
                    .await?;
            }
            _ => {
                if verdict.failure == Some("timeout") {
                    self.metrics.timed_out();
                } else {
                    self.metrics.failed();
                }
                tracing::warn!(
                    job_id = %job.job_id,
                    failure = verdict.failure.unwrap_or("unknown"),
                    exit_code = ?verdict.exit_code,
                    "job failed"
                );
                self.reporter
                    .set_error(&job.job_id, verdict.output.clone(), verdict.exit_code)
                    .await?;
            }
        }
        Ok(verdict)
    }

    async fn execute(
        &self,
        job: &Job,
        language: &LanguageSpec,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let workspace = self.workspaces.create().await?;
        tracing::debug!(job_id = %job.job_id, workspace_id = %workspace.id(), "workspace ready");

        let timeout = Duration::from_millis(self.orchestrator.limits().timeout_ms);
        let result = async {
            workspace
                .write_source(language.source_file_name, &job.code)
                .await?;
            self.orchestrator.run(language, &workspace, timeout).await
        }
        .await;

        if let Ok(outcome) = &result {
            tracing::info!(
                job_id = %job.job_id,
                workspace_id = %workspace.id(),
                exit_code = outcome.exit_code,
                timed_out = outcome.timed_out,
                duration_ms = outcome.duration_ms as u64,
                "sandbox finished"
            );
        }
        workspace.destroy().await;
        result
    }
}

use serde::Deserialize;

use crate::engine::error::PayloadError;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub code: String,
    pub language: String,
}

impl Job {
    pub fn from_payload(raw: &str) -> Result<Self, PayloadError> {
        match serde_json::from_str::<Job>(raw) {
            Ok(job) if job.job_id.trim().is_empty() => {
                Err(PayloadError::Anonymous("jobId is empty".to_string()))
            }
            Ok(job) => Ok(job),
            Err(err) => {
                let job_id = serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .and_then(|v| v.get("jobId").and_then(|id| id.as_str()).map(str::to_string))
                    .filter(|id| !id.trim().is_empty());
                match job_id {
                    Some(job_id) => Err(PayloadError::Identified {
                        job_id,
                        reason: err.to_string(),
                    }),
                    None => Err(PayloadError::Anonymous(err.to_string())),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub timeout_ms: u64,
    pub max_processes: u64,
    pub max_output_bytes: usize,
}

impl ExecutionLimits {
    pub fn normalized(mut self) -> Self {
        self.cpu_cores = self.cpu_cores.clamp(0.1, 4.0);
        self.memory_mb = self.memory_mb.clamp(32, 8192);
        self.timeout_ms = self.timeout_ms.clamp(50, 600_000);
        self.max_processes = self.max_processes.clamp(1, 1024);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 16 * 1024 * 1024);
        self
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    pub fn nano_cpus(&self) -> i64 {
        (f64::from(self.cpu_cores) * 1_000_000_000.0) as i64
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 0.5,
            memory_mb: 256,
            timeout_ms: 30_000,
            max_processes: 64,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// What the sandbox process did, before any sanitization.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i64,
    pub captured_output: Vec<u8>,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration_ms: u128,
}

impl ExecutionOutcome {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.captured_output).into_owned()
    }
}

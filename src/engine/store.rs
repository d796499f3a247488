use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::{Script, aio::ConnectionManager};

use crate::engine::{error::StoreError, models::JobStatus};

// Refuses to touch an entry that already reached a terminal status, so a
// job's final result is written at most once.
const TRANSITION_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if current == 'completed' or current == 'error' then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub output: Option<String>,
    pub exit_code: Option<i64>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Hash fields written for this update, in a stable order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("status", self.status.as_str().to_string())];
        if let Some(output) = &self.output {
            fields.push(("output", output.clone()));
        }
        if let Some(code) = self.exit_code {
            fields.push(("exit_code", code.to_string()));
        }
        let stamp = self.at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if self.status.is_terminal() {
            fields.push(("finished_at", stamp));
        } else {
            fields.push(("started_at", stamp));
        }
        fields
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Applies `update` atomically. Returns `false` when the entry is already
    /// terminal and nothing was written.
    async fn apply(&self, job_id: &str, update: &StatusUpdate) -> Result<bool, StoreError>;
}

pub struct RedisStatusStore {
    manager: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisStatusStore {
    pub async fn connect(client: &redis::Client, key_prefix: String) -> Result<Self, StoreError> {
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            script: Script::new(TRANSITION_LUA),
        })
    }

    fn key(&self, job_id: &str) -> String {
        format!("{}:{}", self.key_prefix, job_id)
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn apply(&self, job_id: &str, update: &StatusUpdate) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut invocation = self.script.key(self.key(job_id));
        for (field, value) in update.fields() {
            invocation.arg(field).arg(value);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }
}

/// Writes the status transitions of jobs.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn StatusStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub async fn set_running(&self, job_id: &str) -> Result<(), StoreError> {
        self.write(job_id, JobStatus::Running, None, None).await
    }

    pub async fn set_completed(
        &self,
        job_id: &str,
        output: String,
        exit_code: i64,
    ) -> Result<(), StoreError> {
        self.write(job_id, JobStatus::Completed, Some(output), Some(exit_code))
            .await
    }

    pub async fn set_error(
        &self,
        job_id: &str,
        message: String,
        exit_code: Option<i64>,
    ) -> Result<(), StoreError> {
        self.write(job_id, JobStatus::Error, Some(message), exit_code)
            .await
    }

    async fn write(
        &self,
        job_id: &str,
        status: JobStatus,
        output: Option<String>,
        exit_code: Option<i64>,
    ) -> Result<(), StoreError> {
        let update = StatusUpdate {
            status,
            output,
            exit_code,
            at: Utc::now(),
        };
        if !self.store.apply(job_id, &update).await? {
            tracing::warn!(
                job_id,
                status = status.as_str(),
                "status entry already terminal, update skipped"
            );
        }
        Ok(())
    }
}

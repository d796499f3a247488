use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

/// Broker hand-off: each payload is delivered to exactly one worker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Blocks up to `wait` for the next raw job payload.
    async fn pop(&self, wait: Duration) -> anyhow::Result<Option<String>>;
}

pub struct RedisJobQueue {
    manager: ConnectionManager,
    queue_name: String,
}

impl RedisJobQueue {
    pub async fn connect(client: &redis::Client, queue_name: String) -> anyhow::Result<Self> {
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to open broker connection")?;
        Ok(Self {
            manager,
            queue_name,
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn pop(&self, wait: Duration) -> anyhow::Result<Option<String>> {
        let mut conn = self.manager.clone();
        let popped: Option<(String, String)> = conn
            .brpop(&self.queue_name, wait.as_secs_f64())
            .await
            .with_context(|| format!("BRPOP {} failed", self.queue_name))?;
        Ok(popped.map(|(_, payload)| payload))
    }
}

//! In-memory stand-ins for the broker, the status store and the sandbox
//! daemon, so the job pipeline can be driven end to end in unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{StreamExt, stream};
use tokio::sync::watch;

use crate::engine::{
    error::StoreError,
    models::JobStatus,
    queue::JobQueue,
    sandbox::{ContainerSpec, OutputStream, SandboxRuntime},
    store::{StatusStore, StatusUpdate},
};

#[derive(Default)]
pub struct MemoryQueue {
    items: tokio::sync::Mutex<VecDeque<String>>,
    failures: AtomicUsize,
}

impl MemoryQueue {
    pub async fn push(&self, payload: impl Into<String>) {
        self.items.lock().await.push_front(payload.into());
    }

    /// Makes the next `n` pops fail with a broker error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn pop(&self, wait: Duration) -> anyhow::Result<Option<String>> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("broker connection reset");
        }
        if let Some(item) = self.items.lock().await.pop_back() {
            return Ok(Some(item));
        }
        tokio::time::sleep(wait).await;
        Ok(self.items.lock().await.pop_back())
    }
}

#[derive(Default)]
pub struct MemoryStatusStore {
    entries: DashMap<String, HashMap<String, String>>,
    history: DashMap<String, Vec<JobStatus>>,
}

impl MemoryStatusStore {
    pub fn field(&self, job_id: &str, field: &str) -> Option<String> {
        self.entries
            .get(job_id)
            .and_then(|entry| entry.get(field).cloned())
    }

    pub fn history(&self, job_id: &str) -> Vec<JobStatus> {
        self.history
            .get(job_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn apply(&self, job_id: &str, update: &StatusUpdate) -> Result<bool, StoreError> {
        let mut entry = self.entries.entry(job_id.to_string()).or_default();
        let terminal = matches!(
            entry.get("status").map(String::as_str),
            Some("completed") | Some("error")
        );
        if terminal {
            return Ok(false);
        }
        for (field, value) in update.fields() {
            entry.insert(field.to_string(), value);
        }
        self.history
            .entry(job_id.to_string())
            .or_default()
            .push(update.status);
        Ok(true)
    }
}

#[derive(Debug, Clone)]
enum Ending {
    Exit(i64),
    Hang,
    BreakStream,
    FailCreate(String),
    FailStart(String),
    Panic(String),
}

/// What every container created by a [`FakeRuntime`] does.
#[derive(Debug, Clone)]
pub struct Script {
    chunks: Vec<Bytes>,
    ending: Ending,
}

impl Script {
    fn new(chunks: &[&str], ending: Ending) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|c| Bytes::copy_from_slice(c.as_bytes()))
                .collect(),
            ending,
        }
    }

    pub fn exits(code: i64, chunks: &[&str]) -> Self {
        Self::new(chunks, Ending::Exit(code))
    }

    /// Prints `chunks`, then runs until killed.
    pub fn hangs(chunks: &[&str]) -> Self {
        Self::new(chunks, Ending::Hang)
    }

    pub fn stream_breaks(chunks: &[&str]) -> Self {
        Self::new(chunks, Ending::BreakStream)
    }

    pub fn fails_create(message: &str) -> Self {
        Self::new(&[], Ending::FailCreate(message.to_string()))
    }

    pub fn fails_start(message: &str) -> Self {
        Self::new(&[], Ending::FailStart(message.to_string()))
    }

    /// Panics inside `create`, as a buggy runtime client would.
    pub fn panics(message: &str) -> Self {
        Self::new(&[], Ending::Panic(message.to_string()))
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::exits(0, &[])
    }
}

struct FakeContainer {
    killed: watch::Sender<bool>,
    exited: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    script: Script,
    containers: DashMap<String, FakeContainer>,
    created: Mutex<Vec<ContainerSpec>>,
    next_id: AtomicUsize,
    forced_removals: AtomicUsize,
}

impl FakeRuntime {
    pub fn with_script(script: Script) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn live_containers(&self) -> usize {
        self.containers.len()
    }

    pub fn forced_removals(&self) -> usize {
        self.forced_removals.load(Ordering::SeqCst)
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        match &self.script.ending {
            Ending::FailCreate(message) => anyhow::bail!("{message}"),
            Ending::Panic(message) => panic!("{message}"),
            _ => {}
        }
        if let Ok(mut created) = self.created.lock() {
            created.push(spec.clone());
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (killed, _) = watch::channel(false);
        self.containers.insert(
            id.clone(),
            FakeContainer {
                killed,
                exited: false,
            },
        );
        Ok(id)
    }

    async fn attach(&self, id: &str) -> anyhow::Result<OutputStream> {
        let mut killed = self
            .containers
            .get(id)
            .map(|c| c.killed.subscribe())
            .ok_or_else(|| anyhow::anyhow!("no such container {id}"))?;
        let ending = self.script.ending.clone();

        let head = stream::iter(self.script.chunks.clone().into_iter().map(Ok));
        let tail = stream::once(async move {
            match ending {
                Ending::BreakStream => Some(Err(anyhow::anyhow!("connection reset by daemon"))),
                Ending::Hang => {
                    let _ = killed.wait_for(|k| *k).await;
                    None
                }
                _ => None,
            }
        })
        .filter_map(|item| async move { item });
        Ok(head.chain(tail).boxed())
    }

    async fn start(&self, _id: &str) -> anyhow::Result<()> {
        if let Ending::FailStart(message) = &self.script.ending {
            anyhow::bail!("{message}");
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> anyhow::Result<i64> {
        let code = match self.script.ending {
            Ending::Exit(code) => code,
            Ending::BreakStream => 0,
            Ending::Hang => {
                let mut killed = self
                    .containers
                    .get(id)
                    .map(|c| c.killed.subscribe())
                    .ok_or_else(|| anyhow::anyhow!("no such container {id}"))?;
                let _ = killed.wait_for(|k| *k).await;
                anyhow::bail!("container {id} was removed while running");
            }
            Ending::FailCreate(_) | Ending::FailStart(_) | Ending::Panic(_) => {
                anyhow::bail!("container never ran")
            }
        };
        if let Some(mut container) = self.containers.get_mut(id) {
            container.exited = true;
        }
        Ok(code)
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        if let Some((_, container)) = self.containers.remove(id) {
            if !container.exited {
                self.forced_removals.fetch_add(1, Ordering::SeqCst);
            }
            let _ = container.killed.send(true);
        }
        Ok(())
    }
}

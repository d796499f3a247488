use std::{collections::HashMap, env, path::PathBuf, str::FromStr, time::Duration};

use crate::engine::{error::ConfigError, models::ExecutionLimits};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub redis_url: String,
    pub queue_name: String,
    pub status_key_prefix: String,
    pub dequeue_poll: Duration,
    pub dequeue_backoff: Duration,
    pub workspace: WorkspaceConfig,
    pub sandbox: SandboxConfig,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Where this process creates and reads workspace directories.
    pub local_base: PathBuf,
    /// How the sandbox daemon sees `local_base` when bind-mounting it.
    pub host_base: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub workdir: String,
    pub limits: ExecutionLimits,
    pub pull_images: bool,
    pub pull_timeout: Duration,
    pub image_overrides: HashMap<String, String>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host_base = lookup("HOST_TMP_DIR")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .ok_or(ConfigError::Missing("HOST_TMP_DIR"))?;

        let workdir = lookup("SANDBOX_WORKDIR").unwrap_or_else(|| "/app".to_string());
        if !workdir.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "SANDBOX_WORKDIR",
                reason: format!("{workdir} is not an absolute path"),
            });
        }

        let defaults = ExecutionLimits::default();
        let limits = ExecutionLimits {
            cpu_cores: env_parse(&lookup, "SANDBOX_CPU_CORES", defaults.cpu_cores),
            memory_mb: env_parse(&lookup, "SANDBOX_MEMORY_MB", defaults.memory_mb),
            timeout_ms: env_parse(&lookup, "JOB_TIMEOUT_MS", defaults.timeout_ms),
            max_processes: env_parse(&lookup, "SANDBOX_MAX_PROCESSES", defaults.max_processes),
            max_output_bytes: env_parse(&lookup, "MAX_OUTPUT_BYTES", defaults.max_output_bytes),
        }
        .normalized();

        Ok(Self {
            redis_url: lookup("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            queue_name: lookup("QUEUE_NAME").unwrap_or_else(|| "code-queue".to_string()),
            status_key_prefix: lookup("STATUS_KEY_PREFIX").unwrap_or_else(|| "job".to_string()),
            dequeue_poll: Duration::from_secs(env_parse(&lookup, "DEQUEUE_POLL_SECS", 5u64).max(1)),
            dequeue_backoff: Duration::from_millis(env_parse(
                &lookup,
                "DEQUEUE_BACKOFF_MS",
                1000u64,
            )),
            workspace: WorkspaceConfig {
                local_base: PathBuf::from(
                    lookup("WORKER_TMP_DIR").unwrap_or_else(|| "/worker-tmp".to_string()),
                ),
                host_base: PathBuf::from(host_base),
            },
            sandbox: SandboxConfig {
                workdir,
                limits,
                pull_images: env_parse(&lookup, "SANDBOX_PULL_IMAGES", true),
                pull_timeout: Duration::from_secs(
                    env_parse(&lookup, "SANDBOX_PULL_TIMEOUT_SECS", 300u64).max(1),
                ),
                image_overrides: parse_image_overrides(
                    &lookup("LANGUAGE_IMAGES").unwrap_or_default(),
                )?,
            },
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_image_overrides(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut out = HashMap::new();
    for chunk in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let (language, image) = chunk
            .split_once('=')
            .map(|(l, i)| (l.trim(), i.trim()))
            .filter(|(l, i)| !l.is_empty() && !i.is_empty())
            .ok_or_else(|| ConfigError::Invalid {
                key: "LANGUAGE_IMAGES",
                reason: format!("expected language=image, got {chunk}"),
            })?;
        out.insert(language.to_string(), image.to_string());
    }
    Ok(out)
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        AttachContainerOptions, Config, CreateContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::{HostConfig, Mount, MountTypeEnum},
};
use futures_util::{StreamExt, TryStreamExt};

use crate::engine::sandbox::{ContainerSpec, OutputStream, SandboxRuntime};

pub struct DockerRuntime {
    docker: Docker,
    pull_images: bool,
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connects through `DOCKER_HOST` or the local socket.
    pub fn connect(pull_images: bool, pull_timeout: Duration) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to docker daemon")?;
        Ok(Self {
            docker,
            pull_images,
            pull_timeout,
        })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.docker
            .ping()
            .await
            .context("docker daemon did not answer ping")?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.pull_images {
            anyhow::bail!("image {image} is not present and pulling is disabled");
        }

        tracing::info!(image, "pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let pull = async {
            let mut progress = self.docker.create_image(options, None, None);
            while let Some(step) = progress.next().await {
                step.with_context(|| format!("failed to pull image {image}"))?;
            }
            Ok::<_, anyhow::Error>(())
        };
        bounded_pull(image, self.pull_timeout, pull).await
    }
}

/// The container is gone, or the daemon's auto-removal is already under way.
fn already_removed(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

/// A stalled registry must not block the worker forever.
async fn bounded_pull<F>(image: &str, limit: Duration, pull: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(limit, pull).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!(
            "pulling image {image} did not finish within {}s",
            limit.as_secs()
        ),
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.ensure_image(&spec.image).await?;

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            auto_remove: Some(spec.auto_remove),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            mounts: Some(vec![Mount {
                target: Some(spec.mount.target.clone()),
                source: Some(spec.mount.source.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(spec.mount.read_only),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("failed to create container")?;
        for warning in &created.warnings {
            tracing::warn!(container_id = %created.id, warning = %warning, "docker create warning");
        }
        Ok(created.id)
    }

    async fn attach(&self, id: &str) -> anyhow::Result<OutputStream> {
        let attached = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .context("failed to attach to container output")?;

        let stream = attached
            .output
            .try_filter_map(|chunk| async move {
                Ok(match chunk {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => Some(message),
                    LogOutput::StdIn { .. } => None,
                })
            })
            .map_err(anyhow::Error::from);
        Ok(stream.boxed())
    }

    async fn start(&self, id: &str) -> anyhow::Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start container")
    }

    async fn wait(&self, id: &str) -> anyhow::Result<i64> {
        let mut waits = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "removed",
            }),
        );
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit status as an error
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            })) => anyhow::bail!("container {id} was removed before its exit status was read"),
            Some(Err(err)) => Err(err).context("failed waiting for container"),
            None => anyhow::bail!("container wait stream ended without a status"),
        }
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        let result = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if already_removed(&err) => Ok(()),
            Err(err) => Err(err).context("failed to remove container"),
        }
    }
}

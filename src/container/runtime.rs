//! Container runtime abstraction and its Docker implementation.
//!
//! The orchestration core talks to the runtime exclusively through
//! [`ContainerRuntime`] so tests can substitute a fake without a container
//! engine on the host.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkdenError};

use super::resource_limits::{ResourceLimits, CPU_PERIOD_USECS};

/// Port the workspace service listens on inside every container.
pub const WORKSPACE_CONTAINER_PORT: u16 = 8080;

/// Everything needed to create one workspace container.
#[derive(Debug, Clone)]
pub struct ContainerCreateSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub limits: ResourceLimits,
    /// Host port bound to [`WORKSPACE_CONTAINER_PORT`], when the caller has
    /// already allocated one.
    pub host_port: Option<u16>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct InspectInfo {
    pub handle: String,
    pub running: bool,
    pub image: Option<String>,
}

/// One-shot resource usage snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RuntimeUsage {
    pub cpu_total_usage: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids: Option<u64>,
}

/// The runtime operations the lifecycle core depends on. `inspect` fails
/// for unknown handles; `list_containers` exists as a liveness probe.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerCreateSpec) -> Result<String>;
    async fn start(&self, handle: &str) -> Result<()>;
    async fn stop(&self, handle: &str) -> Result<()>;
    async fn remove(&self, handle: &str) -> Result<()>;
    async fn inspect(&self, handle: &str) -> Result<InspectInfo>;
    /// Run a command inside the container, returning combined output.
    /// Fails when the command exits non-zero.
    async fn exec(&self, handle: &str, command: &[&str]) -> Result<String>;
    async fn stats(&self, handle: &str) -> Result<RuntimeUsage>;
    async fn list_containers(&self) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;
}

/// Docker-backed runtime client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_socket_defaults()
            .or_else(|_| Docker::connect_with_local_defaults())
            .map_err(|e| WorkdenError::runtime(format!("failed to connect to Docker: {e}")))?;

        let runtime = Self { docker };
        runtime.ping().await?;
        info!("Docker client initialized");
        Ok(runtime)
    }

    pub fn with_docker(docker: Docker) -> Self {
        Self { docker }
    }

    fn host_config(spec: &ContainerCreateSpec) -> HostConfig {
        let port_bindings = spec.host_port.map(|host_port| {
            let mut bindings = HashMap::new();
            bindings.insert(
                format!("{WORKSPACE_CONTAINER_PORT}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
            bindings
        });

        HostConfig {
            memory: Some(spec.limits.memory.bytes()),
            cpu_quota: Some(spec.limits.cpu.quota_usecs()),
            cpu_period: Some(CPU_PERIOD_USECS),
            cpu_shares: spec.limits.cpu.shares.map(|s| s as i64),
            port_bindings,

            // Workspace containers run hardened: no privilege escalation,
            // no capabilities beyond file ownership, bounded process count.
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["CHOWN".to_string()]),
            privileged: Some(false),
            pids_limit: Some(128),
            readonly_rootfs: Some(true),
            tmpfs: Some({
                let disk_mb = spec.limits.disk.limit_mb;
                let mut tmpfs = HashMap::new();
                tmpfs.insert(
                    "/tmp".to_string(),
                    format!("size={}m,noexec,nosuid,nodev", disk_mb / 4),
                );
                tmpfs.insert(
                    "/workspace".to_string(),
                    format!("size={}m,nodev,nosuid", disk_mb / 2),
                );
                tmpfs
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerCreateSpec) -> Result<String> {
        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some("/workspace".to_string()),
            user: Some("1000:1000".to_string()),
            tty: Some(true),
            open_stdin: Some(true),
            hostname: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(Self::host_config(spec)),
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
            .await?;

        debug!(handle = %created.id, image = %spec.image, "created container");
        Ok(created.id)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.docker
            .start_container(handle, None::<bollard::container::StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.docker
            .stop_container(handle, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> Result<InspectInfo> {
        let response = self.docker.inspect_container(handle, None).await?;
        Ok(InspectInfo {
            handle: response.id.unwrap_or_else(|| handle.to_string()),
            running: response
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false),
            image: response.image,
        })
    }

    async fn exec(&self, handle: &str, command: &[&str]) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command.iter().map(|s| s.to_string()).collect()),
                    ..Default::default()
                },
            )
            .await?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(Ok(msg)) = output.next().await {
                collected.push_str(&String::from_utf8_lossy(&msg.into_bytes()));
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        match inspected.exit_code {
            Some(0) | None => Ok(collected),
            Some(code) => Err(WorkdenError::runtime(format!(
                "exec exited with code {code}: {}",
                collected.trim()
            ))),
        }
    }

    async fn stats(&self, handle: &str) -> Result<RuntimeUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.docker.stats(handle, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(RuntimeUsage {
                cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
                memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
                memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
                pids: stats.pids_stats.current,
            }),
            Some(Err(e)) => Err(e.into()),
            None => Err(WorkdenError::runtime(format!(
                "no stats returned for container {handle}"
            ))),
        }
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.id)
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(|e| {
            warn!("Docker daemon ping failed: {e}");
            WorkdenError::runtime(format!("Docker daemon is not available: {e}"))
        })?;
        Ok(())
    }
}

//! Container runtime seam
//!
//! The registry only talks to [`ContainerRuntime`]. [`DockerRuntime`] is the
//! production implementation on top of testcontainers; tests substitute a mock.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use testcontainers::core::wait::LogWaitStrategy;
use testcontainers::core::{ContainerPort, ExecCommand, ExecResult, IntoContainerPort, Mount, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ContainerRequest, GenericImage, ImageExt};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::descriptor::{LogStream, ServiceDescriptor};
use crate::error::{ResourceError, ResourceResult};

/// What the runtime reports about a freshly started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub host: String,
    /// container port -> host port
    pub ports: BTreeMap<u16, u16>,
}

/// Result of a command executed inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for error payloads
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container for the descriptor
    ///
    /// Returns as soon as the container is running; readiness is checked separately.
    async fn start(&self, descriptor: &ServiceDescriptor) -> ResourceResult<ContainerInfo>;

    /// Run a command inside a started container
    async fn exec(&self, container_id: &str, cmd: &[String]) -> ResourceResult<ExecOutput>;

    /// Stop and remove a container
    async fn stop(&self, container_id: &str) -> ResourceResult<()>;
}

/// Split `repo/name:tag` into (`repo/name`, `tag`), defaulting the tag to `latest`
pub fn split_image_reference(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// testcontainers-backed runtime
///
/// Containers stay alive while this runtime holds them; `stop` removes them
/// and dropping the runtime lets testcontainers clean up the rest.
///
/// Built with [`DockerRuntime::on_runtime`], every Docker call runs on the
/// given tokio runtime instead of the caller's. Containers then outlive the
/// test runtime that started them and can be removed at process exit.
#[derive(Clone, Default)]
pub struct DockerRuntime {
    containers: Arc<Mutex<HashMap<String, Arc<ContainerAsync<GenericImage>>>>>,
    handle: Option<Handle>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_runtime(handle: Handle) -> Self {
        Self {
            containers: Arc::default(),
            handle: Some(handle),
        }
    }

    async fn run<F, T>(&self, task: F) -> ResourceResult<T>
    where
        F: Future<Output = ResourceResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        match &self.handle {
            Some(handle) => handle
                .spawn(task)
                .await
                .map_err(|e| ResourceError::Runtime(format!("Docker task failed: {}", e)))?,
            None => task.await,
        }
    }

    async fn container(&self, container_id: &str) -> ResourceResult<Arc<ContainerAsync<GenericImage>>> {
        self.containers
            .lock()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| ResourceError::Runtime(format!("Unknown container {}", container_id)))
    }

    fn request(descriptor: &ServiceDescriptor) -> ContainerRequest<GenericImage> {
        let (name, tag) = split_image_reference(&descriptor.image);

        let mut image = GenericImage::new(name, tag);
        for binding in &descriptor.ports {
            image = image.with_exposed_port(binding.container_port.tcp());
        }
        for wait in &descriptor.log_waits {
            let strategy = match wait.stream {
                LogStream::Stdout => LogWaitStrategy::stdout(&wait.message),
                LogStream::Stderr => LogWaitStrategy::stderr(&wait.message),
            };
            image = image.with_wait_for(WaitFor::Log(strategy.with_times(wait.times)));
        }

        let mut request: ContainerRequest<GenericImage> = image.into();
        for binding in &descriptor.ports {
            if let Some(host_port) = binding.host_port {
                request = request.with_mapped_port(host_port, binding.container_port.tcp());
            }
        }
        for (key, value) in &descriptor.env {
            request = request.with_env_var(key, value);
        }
        if !descriptor.cmd.is_empty() {
            request = request.with_cmd(descriptor.cmd.clone());
        }
        if let Some(cache) = &descriptor.cache {
            request = request.with_mount(Mount::bind_mount(
                cache.host_dir.to_string_lossy().into_owned(),
                cache.container_dir.clone(),
            ));
        }
        for (path, contents) in &descriptor.files {
            request = request.with_copy_to(path.clone(), contents.clone());
        }
        if let Some(timeout) = descriptor.startup_timeout {
            request = request.with_startup_timeout(timeout);
        }

        request
    }
}

/// Drain both output streams, then read the exit code
///
/// `ExecResult::exit_code` borrows the result across an await and the result
/// is not `Sync`, so the reads are driven on a blocking thread.
async fn collect_output(mut result: ExecResult) -> ResourceResult<ExecOutput> {
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || {
        handle.block_on(async move {
            let stdout = String::from_utf8_lossy(&result.stdout_to_vec().await?).into_owned();
            let stderr = String::from_utf8_lossy(&result.stderr_to_vec().await?).into_owned();
            let exit_code = result.exit_code().await?;
            Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            })
        })
    })
    .await
    .map_err(|e| ResourceError::Runtime(format!("Exec output task failed: {}", e)))?
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, descriptor: &ServiceDescriptor) -> ResourceResult<ContainerInfo> {
        info!(image = %descriptor.image, "Starting container");

        let request = Self::request(descriptor);
        let container_ports: Vec<u16> = descriptor.ports.iter().map(|b| b.container_port).collect();

        let (container, host, ports) = self
            .run(async move {
                let container = request.start().await?;
                let host = container.get_host().await?.to_string();

                let mut ports = BTreeMap::new();
                for container_port in container_ports {
                    let host_port = container
                        .get_host_port_ipv4(ContainerPort::Tcp(container_port))
                        .await?;
                    ports.insert(container_port, host_port);
                }
                Ok((container, host, ports))
            })
            .await?;

        let id = container.id().to_string();
        debug!(container_id = %id, %host, ?ports, "Container running");

        self.containers
            .lock()
            .await
            .insert(id.clone(), Arc::new(container));

        Ok(ContainerInfo { id, host, ports })
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> ResourceResult<ExecOutput> {
        let container = self.container(container_id).await?;

        debug!(container_id, ?cmd, "Executing in container");
        let cmd = cmd.to_vec();
        self.run(async move {
            let result = container.exec(ExecCommand::new(cmd)).await?;
            collect_output(result).await
        })
        .await
    }

    async fn stop(&self, container_id: &str) -> ResourceResult<()> {
        let Some(container) = self.containers.lock().await.remove(container_id) else {
            warn!(container_id, "Stop requested for unknown container");
            return Ok(());
        };

        self.run(async move {
            match Arc::try_unwrap(container) {
                Ok(container) => container.rm().await?,
                // an exec still holds it; testcontainers removes it on the last drop
                Err(container) => container.stop().await?,
            }
            Ok(())
        })
        .await?;

        info!(container_id, "Container removed");
        Ok(())
    }
}

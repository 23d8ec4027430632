//! Process-wide lifecycle manager
//!
//! Ties the registry, the asset provisioner and the exporter together:
//! "ensure service X is running with assets Y, then give me its connection
//! parameters".
//!
//! The shared manager drives Docker from a dedicated tokio runtime and stops
//! every service it started when the process exits.

use std::sync::Arc;

use core_config::FromEnv;
use once_cell::sync::OnceCell;
use reqwest::Client;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::assets::{AssetBackend, AssetId, AssetProvisioner, AssetRecord, CliAssetBackend, HttpAssetBackend};
use crate::catalog::ServiceKind;
use crate::config::ResourceConfig;
use crate::descriptor::{AssetSource, ServiceDescriptor, ServiceLabel};
use crate::error::{ResourceError, ResourceResult};
use crate::export::{self, ConnectionParameters, PropertySink};
use crate::instance::RunningInstance;
use crate::metrics::ResourceMetrics;
use crate::probe;
use crate::registry::ServiceRegistry;
use crate::runtime::{ContainerRuntime, DockerRuntime};

static SHARED: OnceCell<ServiceManager> = OnceCell::new();
static DOCKER_RUNTIME: OnceCell<Runtime> = OnceCell::new();

pub struct ServiceManager {
    config: ResourceConfig,
    client: Client,
    registry: ServiceRegistry,
    provisioner: AssetProvisioner,
}

impl ServiceManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ResourceConfig) -> Self {
        Self {
            client: probe::http_client(),
            registry: ServiceRegistry::new(runtime, &config),
            provisioner: AssetProvisioner::new(config.fetch_timeout),
            config,
        }
    }

    /// The manager shared by every test in the process
    ///
    /// Built on first use over Docker, configured from the environment.
    /// An invalid environment falls back to the defaults with a warning.
    ///
    /// Containers outlive the test that started them and are removed when the
    /// process exits.
    pub fn shared() -> &'static ServiceManager {
        SHARED.get_or_init(|| {
            let config = ResourceConfig::from_env().unwrap_or_else(|err| {
                warn!(error = %err, "Invalid test resource configuration, using defaults");
                ResourceConfig::default()
            });
            ResourceMetrics::describe();

            let runtime = match docker_runtime() {
                Ok(runtime) => DockerRuntime::on_runtime(runtime.handle().clone()),
                Err(err) => {
                    warn!(error = %err, "Could not start the Docker runtime, using the caller's");
                    DockerRuntime::new()
                }
            };
            register_exit_teardown();

            ServiceManager::new(Arc::new(runtime), config)
        })
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn provisioner(&self) -> &AssetProvisioner {
        &self.provisioner
    }

    /// Start (or reuse) the service, make every asset present, and return
    /// its connection parameters
    pub async fn ensure(
        &self,
        label: &ServiceLabel,
        descriptor: &ServiceDescriptor,
        assets: &[AssetId],
    ) -> ResourceResult<ConnectionParameters> {
        let instance = self.registry.start_if_needed(label, descriptor).await?;

        if !assets.is_empty() {
            let backend = self.backend(&instance, descriptor)?;
            for asset in assets {
                self.provision(&instance, descriptor, backend.as_ref(), asset)
                    .await?;
            }
        }

        export::connection_parameters(&instance, descriptor)
    }

    /// [`ServiceManager::ensure`] for a catalog service
    pub async fn ensure_kind(
        &self,
        kind: ServiceKind,
        assets: &[AssetId],
    ) -> ResourceResult<ConnectionParameters> {
        let descriptor = kind.descriptor(&self.config);
        self.ensure(&kind.label(), &descriptor, assets).await
    }

    /// Make one asset present in an already running service
    pub async fn ensure_asset(
        &self,
        label: &ServiceLabel,
        descriptor: &ServiceDescriptor,
        asset: &AssetId,
    ) -> ResourceResult<AssetRecord> {
        let instance = self
            .registry
            .get(label)
            .ok_or_else(|| ResourceError::NotRunning(label.clone()))?;
        let backend = self.backend(&instance, descriptor)?;
        self.provision(&instance, descriptor, backend.as_ref(), asset)
            .await
    }

    /// Write the connection parameters of a running service into `sink`
    pub fn export_into(
        &self,
        label: &ServiceLabel,
        descriptor: &ServiceDescriptor,
        sink: &mut dyn PropertySink,
    ) -> ResourceResult<ConnectionParameters> {
        let instance = self
            .registry
            .get(label)
            .ok_or_else(|| ResourceError::NotRunning(label.clone()))?;
        export::export(&instance, descriptor, sink)
    }

    /// Stop every service and forget what was provisioned into it
    pub async fn shutdown(&self) -> Vec<Arc<RunningInstance>> {
        let stopped = self.registry.shutdown().await;
        for instance in &stopped {
            self.provisioner.forget_instance(&instance.container_id);
        }
        stopped
    }

    /// Blocking [`ServiceManager::shutdown`] driven on `runtime`
    ///
    /// Runs on a scoped thread, so it is safe to call from inside another
    /// runtime and from an exit handler. Returns how many services stopped.
    pub fn shutdown_blocking(&self, runtime: &Runtime) -> usize {
        std::thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(self.shutdown()).len())
                .join()
                .unwrap_or(0)
        })
    }

    async fn provision(
        &self,
        instance: &RunningInstance,
        descriptor: &ServiceDescriptor,
        backend: &dyn AssetBackend,
        asset: &AssetId,
    ) -> ResourceResult<AssetRecord> {
        let cache_dir = descriptor.cache.as_ref().map(|cache| cache.host_dir.as_path());
        let record = self
            .provisioner
            .ensure(instance, backend, asset, cache_dir)
            .await?;
        debug!(service = %instance.label, asset = %asset, state = %record.state, fetched = record.fetched, "Asset ensured");
        Ok(record)
    }

    fn backend(
        &self,
        instance: &RunningInstance,
        descriptor: &ServiceDescriptor,
    ) -> ResourceResult<Box<dyn AssetBackend>> {
        match &descriptor.assets {
            Some(AssetSource::Http {
                port,
                list_path,
                fetch_path,
            }) => {
                let base_url = instance.url("http", *port).ok_or_else(|| {
                    ResourceError::Config(format!(
                        "Asset port {} of '{}' is not published",
                        port, instance.label
                    ))
                })?;
                Ok(Box::new(HttpAssetBackend::new(
                    self.client.clone(),
                    base_url,
                    list_path.clone(),
                    fetch_path.clone(),
                )))
            }
            Some(AssetSource::Cli { list_cmd, pull_cmd }) => Ok(Box::new(CliAssetBackend::new(
                Arc::clone(self.registry.runtime()),
                instance.container_id.clone(),
                list_cmd.clone(),
                pull_cmd.clone(),
            ))),
            None => Err(ResourceError::Config(format!(
                "Service '{}' does not support assets",
                instance.label
            ))),
        }
    }
}

fn docker_runtime() -> std::io::Result<&'static Runtime> {
    DOCKER_RUNTIME.get_or_try_init(|| {
        Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("test-resources-docker")
            .enable_all()
            .build()
    })
}

fn register_exit_teardown() {
    // SAFETY: the handler is a plain extern "C" fn; panics stay on its scoped thread
    if unsafe { libc::atexit(teardown_shared) } != 0 {
        warn!("Could not register exit teardown, shared containers will outlive the process");
    }
}

extern "C" fn teardown_shared() {
    let Some(manager) = SHARED.get() else {
        return;
    };
    if manager.registry.labels().is_empty() {
        return;
    }

    let stopped = match DOCKER_RUNTIME.get() {
        Some(runtime) => manager.shutdown_blocking(runtime),
        None => match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => manager.shutdown_blocking(&runtime),
            Err(err) => {
                warn!(error = %err, "No runtime for exit teardown");
                return;
            }
        },
    };
    info!(stopped, "Shared services removed at exit");
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::assets::AssetState;
    use crate::descriptor::{Credentials, ReadinessCheck};
    use crate::runtime::{ContainerInfo, ExecOutput, MockContainerRuntime};

    fn config() -> ResourceConfig {
        ResourceConfig {
            startup_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            cache_dir: None,
        }
    }

    /// Runtime whose single container publishes `container_port` on `host_port`
    fn runtime_on(container_port: u16, host_port: u16, starts: Arc<AtomicUsize>) -> MockContainerRuntime {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start().returning(move |_| {
            let n = starts.fetch_add(1, Ordering::SeqCst);
            Ok(ContainerInfo {
                id: format!("container-{}", n),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(container_port, host_port)]),
            })
        });
        runtime.expect_stop().returning(|_| Ok(()));
        runtime
    }

    fn speaches_like() -> ServiceDescriptor {
        ServiceDescriptor::new("ghcr.io/speaches-ai/speaches:latest-cpu", 8000)
            .with_readiness(ReadinessCheck::http(8000, "/health"))
            .with_assets(AssetSource::Http {
                port: 8000,
                list_path: "/v1/models".into(),
                fetch_path: "/v1/models/{id}".into(),
            })
            .with_properties("speaches", Some("http"))
    }

    async fn speaches_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_ensure_fetches_missing_asset_once() {
        let server = speaches_server().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "Systran/faster-whisper-tiny"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/models/Systran/faster-whisper-tiny"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let starts = Arc::new(AtomicUsize::new(0));
        let manager = ServiceManager::new(
            Arc::new(runtime_on(8000, server.address().port(), starts.clone())),
            config(),
        );
        let label = ServiceLabel::new("Speaches");
        let descriptor = speaches_like();
        let asset = AssetId::parse("Systran/faster-whisper-tiny").unwrap();

        let first = manager
            .ensure(&label, &descriptor, std::slice::from_ref(&asset))
            .await
            .unwrap();
        let second = manager
            .ensure(&label, &descriptor, std::slice::from_ref(&asset))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.get("speaches.base-url"),
            Some(format!("http://127.0.0.1:{}", server.address().port()).as_str())
        );

        let instance = manager.registry().get(&label).unwrap();
        assert_eq!(manager.provisioner().state(&instance, &asset), AssetState::Present);
    }

    #[tokio::test]
    async fn test_ensure_asset_through_container_cli() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let pulled = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = runtime_on(11434, port, Arc::new(AtomicUsize::new(0)));
        let seen = pulled.clone();
        runtime.expect_exec().returning(move |_, cmd| {
            if cmd[1] == "list" {
                return Ok(ExecOutput {
                    exit_code: Some(0),
                    stdout: "NAME    ID    SIZE    MODIFIED\n".into(),
                    stderr: String::new(),
                });
            }
            seen.lock().unwrap().push(cmd.to_vec());
            Ok(ExecOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        });

        let manager = ServiceManager::new(Arc::new(runtime), config());
        let label = ServiceLabel::new("Ollama-mini");
        let descriptor = ServiceDescriptor::new("ollama/ollama:0.5.7", 11434).with_assets(AssetSource::Cli {
            list_cmd: vec!["ollama".into(), "list".into()],
            pull_cmd: vec!["ollama".into(), "pull".into()],
        });

        manager.ensure(&label, &descriptor, &[]).await.unwrap();
        let record = manager
            .ensure_asset(&label, &descriptor, &AssetId::parse("tinyllama").unwrap())
            .await
            .unwrap();

        assert!(record.fetched);
        assert_eq!(record.container_id, "container-0");
        assert_eq!(
            *pulled.lock().unwrap(),
            vec![vec!["ollama".to_string(), "pull".into(), "tinyllama".into()]]
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_assets_need_a_source() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = ServiceManager::new(
            Arc::new(runtime_on(5432, port, Arc::new(AtomicUsize::new(0)))),
            config(),
        );

        let err = manager
            .ensure(
                &ServiceLabel::new("Pg-vector"),
                &ServiceDescriptor::new("pgvector/pgvector:pg16", 5432),
                &[AssetId::parse("llama3.2:1b").unwrap()],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ResourceError::Config(_)));
        assert!(manager.registry().is_running(&ServiceLabel::new("Pg-vector")));
    }

    #[tokio::test]
    async fn test_export_requires_running_service() {
        let manager = ServiceManager::new(Arc::new(MockContainerRuntime::new()), config());
        let mut sink: HashMap<String, String> = HashMap::new();

        let err = manager
            .export_into(
                &ServiceLabel::new("Pg-vector"),
                &ServiceDescriptor::new("pgvector/pgvector:pg16", 5432),
                &mut sink,
            )
            .unwrap_err();

        assert!(matches!(err, ResourceError::NotRunning(_)));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_export_into_and_shutdown() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = ServiceManager::new(
            Arc::new(runtime_on(5432, port, Arc::new(AtomicUsize::new(0)))),
            config(),
        );
        let label = ServiceLabel::new("Pg-vector");
        let descriptor = ServiceDescriptor::new("pgvector/pgvector:pg16", 5432)
            .with_credentials(Credentials::new("postgres", "postgres"))
            .with_properties("pgvector", None);

        manager.ensure(&label, &descriptor, &[]).await.unwrap();

        let mut sink: BTreeMap<String, String> = BTreeMap::new();
        manager.export_into(&label, &descriptor, &mut sink).unwrap();
        assert_eq!(sink.get("pgvector.port"), Some(&port.to_string()));
        assert_eq!(sink.get("pgvector.username").map(String::as_str), Some("postgres"));

        let stopped = manager.shutdown().await;
        assert_eq!(stopped.len(), 1);
        assert!(manager.registry().labels().is_empty());
        drop(listener);
    }

    #[test]
    fn test_shared_is_one_instance() {
        let first = ServiceManager::shared();
        let second = std::thread::spawn(ServiceManager::shared).join().unwrap();

        assert!(std::ptr::eq(first, second));
        assert!(std::ptr::eq(first, ServiceManager::shared()));
    }

    #[test]
    fn test_shutdown_blocking_stops_running_services() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start().times(1).returning(move |_| {
            Ok(ContainerInfo {
                id: "left-running".into(),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(5432, port)]),
            })
        });
        runtime
            .expect_stop()
            .withf(|id| id == "left-running")
            .times(1)
            .returning(|_| Ok(()));

        let driver = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let manager = ServiceManager::new(Arc::new(runtime), config());
        let label = ServiceLabel::new("Pg-vector");
        driver
            .block_on(manager.ensure(&label, &ServiceDescriptor::new("pgvector/pgvector:pg16", 5432), &[]))
            .unwrap();

        assert_eq!(manager.shutdown_blocking(&driver), 1);
        assert!(!manager.registry().is_running(&label));
        assert_eq!(manager.shutdown_blocking(&driver), 0);
        drop(listener);
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_provisioned_assets() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start().times(1).returning(move |_| {
            Ok(ContainerInfo {
                id: "ollama-0".into(),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(11434, port)]),
            })
        });
        runtime.expect_exec().returning(|_, cmd| {
            let stdout = if cmd[1] == "list" { "NAME    ID    SIZE    MODIFIED\n" } else { "" };
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout: stdout.into(),
                stderr: String::new(),
            })
        });
        runtime
            .expect_stop()
            .times(1)
            .returning(|_| Err(ResourceError::Runtime("daemon unavailable".into())));
        runtime.expect_stop().times(1).returning(|_| Ok(()));

        let manager = ServiceManager::new(Arc::new(runtime), config());
        let label = ServiceLabel::new("Ollama-mini");
        let descriptor = ServiceDescriptor::new("ollama/ollama:0.5.7", 11434).with_assets(AssetSource::Cli {
            list_cmd: vec!["ollama".into(), "list".into()],
            pull_cmd: vec!["ollama".into(), "pull".into()],
        });
        let model = AssetId::parse("tinyllama").unwrap();

        manager
            .ensure(&label, &descriptor, std::slice::from_ref(&model))
            .await
            .unwrap();
        let instance = manager.registry().get(&label).unwrap();

        assert!(manager.shutdown().await.is_empty());
        assert!(manager.registry().is_running(&label));
        assert_eq!(manager.provisioner().state(&instance, &model), AssetState::Present);

        assert_eq!(manager.shutdown().await.len(), 1);
        assert_eq!(manager.provisioner().state(&instance, &model), AssetState::Absent);
        drop(listener);
    }
}

//! Running-instance registry
//!
//! At most one instance per label. Start-or-reuse decisions are serialized per
//! label, so distinct services can start in parallel while a single label is
//! never started twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::binder;
use crate::config::ResourceConfig;
use crate::descriptor::{ServiceDescriptor, ServiceLabel};
use crate::error::{ResourceError, ResourceResult};
use crate::hooks::HookContext;
use crate::instance::RunningInstance;
use crate::metrics::ResourceMetrics;
use crate::probe;
use crate::runtime::ContainerRuntime;

pub struct ServiceRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    client: Client,
    startup_timeout: Duration,
    poll_interval: Duration,
    instances: Mutex<BTreeMap<ServiceLabel, Arc<RunningInstance>>>,
    gates: Mutex<HashMap<ServiceLabel, Arc<tokio::sync::Mutex<()>>>>,
}

impl ServiceRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &ResourceConfig) -> Self {
        Self {
            runtime,
            client: probe::http_client(),
            startup_timeout: config.startup_timeout,
            poll_interval: config.poll_interval,
            instances: Mutex::new(BTreeMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn is_running(&self, label: &ServiceLabel) -> bool {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(label)
    }

    pub fn get(&self, label: &ServiceLabel) -> Option<Arc<RunningInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .cloned()
    }

    /// Labels of every registered instance, sorted
    pub fn labels(&self) -> Vec<ServiceLabel> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Return the running instance for `label`, starting it first if needed
    ///
    /// A fresh start checks fixed host ports, starts the container, waits for
    /// readiness and then runs the descriptor's init hook once. A readiness
    /// failure stops the container and registers nothing. A hook failure
    /// leaves the instance registered and returns `InitializationFailure`.
    pub async fn start_if_needed(
        &self,
        label: &ServiceLabel,
        descriptor: &ServiceDescriptor,
    ) -> ResourceResult<Arc<RunningInstance>> {
        let gate = self.gate(label);
        let _guard = gate.lock().await;

        if let Some(existing) = self.get(label) {
            debug!(service = %label, container_id = %existing.container_id, "Reusing running instance");
            ResourceMetrics::container_reused(label.as_str());
            return Ok(existing);
        }

        binder::ensure_ports_available(&descriptor.ports)?;

        let started = Instant::now();
        let container = self.runtime.start(descriptor).await?;
        let instance = Arc::new(RunningInstance::new(label.clone(), container));

        let timeout = descriptor.startup_timeout.unwrap_or(self.startup_timeout);
        if let Err(err) = probe::wait_until_ready(
            &self.client,
            &instance,
            &descriptor.readiness,
            timeout,
            self.poll_interval,
        )
        .await
        {
            warn!(service = %label, error = %err, "Service did not become ready, stopping it");
            if let Err(stop_err) = self.runtime.stop(&instance.container_id).await {
                warn!(service = %label, error = %stop_err, "Failed to stop unready container");
            }
            return Err(err);
        }

        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(label.clone(), Arc::clone(&instance));

        ResourceMetrics::container_started(label.as_str(), started.elapsed());
        info!(
            service = %label,
            image = %descriptor.image,
            host = %instance.host,
            ports = ?instance.ports,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Service started"
        );

        if let Some(hook) = &descriptor.init_hook {
            let ctx = HookContext {
                instance: &instance,
                runtime: self.runtime.as_ref(),
                credentials: descriptor.credentials.as_ref(),
            };
            hook.run(&ctx).await.map_err(|err| match err {
                err @ ResourceError::InitializationFailure { .. } => err,
                other => ResourceError::InitializationFailure {
                    label: label.clone(),
                    hook: hook.name().to_string(),
                    message: other.to_string(),
                },
            })?;
        }

        Ok(instance)
    }

    /// Stop and unregister one instance
    ///
    /// The instance stays registered when the runtime fails to stop it.
    pub async fn stop(&self, label: &ServiceLabel) -> ResourceResult<Option<Arc<RunningInstance>>> {
        let gate = self.gate(label);
        let _guard = gate.lock().await;

        let Some(instance) = self.get(label) else {
            return Ok(None);
        };

        self.runtime.stop(&instance.container_id).await?;
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(label);

        info!(service = %label, "Service stopped");
        Ok(Some(instance))
    }

    /// Stop every registered instance; returns the stopped instances
    ///
    /// Errors are logged and do not prevent the remaining instances from stopping.
    pub async fn shutdown(&self) -> Vec<Arc<RunningInstance>> {
        let mut stopped = Vec::new();
        for label in self.labels() {
            match self.stop(&label).await {
                Ok(Some(instance)) => stopped.push(instance),
                Ok(None) => {}
                Err(err) => warn!(service = %label, error = %err, "Failed to stop service"),
            }
        }
        stopped
    }

    fn gate(&self, label: &ServiceLabel) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(label.clone())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::descriptor::{PortBinding, ReadinessCheck};
    use crate::hooks::InitHook;
    use crate::runtime::{ContainerInfo, MockContainerRuntime};

    fn config() -> ResourceConfig {
        ResourceConfig {
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            ..ResourceConfig::default()
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// A runtime whose "containers" are local listeners on a pre-chosen port
    fn listening_runtime(host_port: u16, starts: Arc<AtomicUsize>) -> MockContainerRuntime {
        let listeners = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start().returning(move |descriptor| {
            let n = starts.fetch_add(1, Ordering::SeqCst);
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, host_port)).unwrap();
            listeners.lock().unwrap().push(listener);
            Ok(ContainerInfo {
                id: format!("container-{}", n),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(descriptor.properties.port, host_port)]),
            })
        });
        runtime.expect_stop().returning(|_| Ok(()));
        runtime
    }

    #[tokio::test]
    async fn test_second_call_reuses_instance() {
        let port = free_port();
        let starts = Arc::new(AtomicUsize::new(0));
        let registry = ServiceRegistry::new(
            Arc::new(listening_runtime(port, starts.clone())),
            &config(),
        );
        let label = ServiceLabel::new("X");
        let descriptor = ServiceDescriptor::new("pgvector/pgvector:pg16", 5432);

        assert!(!registry.is_running(&label));
        let first = registry.start_if_needed(&label, &descriptor).await.unwrap();
        let second = registry.start_if_needed(&label, &descriptor).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(registry.is_running(&label));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_start_creates_one_instance() {
        let port = free_port();
        let starts = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(listening_runtime(port, starts.clone())),
            &config(),
        ));
        let label = ServiceLabel::new("X");
        let descriptor = ServiceDescriptor::new("pgvector/pgvector:pg16", 5432)
            .with_readiness(ReadinessCheck::port(5432));

        let a = {
            let (registry, label, descriptor) = (registry.clone(), label.clone(), descriptor.clone());
            tokio::spawn(async move { registry.start_if_needed(&label, &descriptor).await })
        };
        let b = {
            let (registry, label, descriptor) = (registry.clone(), label.clone(), descriptor.clone());
            tokio::spawn(async move { registry.start_if_needed(&label, &descriptor).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(a.container_id, b.container_id);
        assert_eq!(a.host_port(5432), Some(port));
        assert_eq!(b.host_port(5432), Some(port));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_start_on_fixed_port_creates_one_instance() {
        let port = free_port();
        let starts = Arc::new(AtomicUsize::new(0));
        let listeners = Arc::new(Mutex::new(Vec::new()));

        let mut runtime = MockContainerRuntime::new();
        let counter = starts.clone();
        runtime.expect_start().returning(move |descriptor| {
            let host_port = descriptor.fixed_host_ports().next().unwrap();
            let n = counter.fetch_add(1, Ordering::SeqCst);
            // published the way Docker does, on every interface
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, host_port)).unwrap();
            listeners.lock().unwrap().push(listener);
            Ok(ContainerInfo {
                id: format!("container-{}", n),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(5432, host_port)]),
            })
        });

        let registry = Arc::new(ServiceRegistry::new(Arc::new(runtime), &config()));
        let label = ServiceLabel::new("Pg-vector");
        let descriptor = ServiceDescriptor::new("pgvector/pgvector:pg16", 5432).with_fixed_port(port);

        let a = {
            let (registry, label, descriptor) = (registry.clone(), label.clone(), descriptor.clone());
            tokio::spawn(async move { registry.start_if_needed(&label, &descriptor).await })
        };
        let b = {
            let (registry, label, descriptor) = (registry.clone(), label.clone(), descriptor.clone());
            tokio::spawn(async move { registry.start_if_needed(&label, &descriptor).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.host_port(5432), Some(port));
        assert_eq!(b.host_port(5432), Some(port));

        // a second container on the same label would have hit the bound port
        assert!(matches!(
            binder::ensure_ports_available(&descriptor.ports),
            Err(ResourceError::PortConflict { port: p, .. }) if p == port
        ));
    }

    #[tokio::test]
    async fn test_readiness_timeout_returns_no_handle() {
        let port = free_port();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start().times(1).returning(move |_| {
            Ok(ContainerInfo {
                id: "silent".into(),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(5432, port)]),
            })
        });
        runtime
            .expect_stop()
            .withf(|id| id == "silent")
            .times(1)
            .returning(|_| Ok(()));

        let registry = ServiceRegistry::new(Arc::new(runtime), &config());
        let label = ServiceLabel::new("X");
        let descriptor = ServiceDescriptor::new("pgvector/pgvector:pg16", 5432)
            .with_startup_timeout(Duration::from_millis(150));

        let err = registry.start_if_needed(&label, &descriptor).await.unwrap_err();

        assert!(matches!(err, ResourceError::StartupTimeout { .. }));
        assert!(!registry.is_running(&label));
    }

    #[tokio::test]
    async fn test_port_conflict_before_start() {
        let holder = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start().times(0);

        let registry = ServiceRegistry::new(Arc::new(runtime), &config());
        let descriptor = ServiceDescriptor::new("pgvector/pgvector:pg16", 5432)
            .with_port(PortBinding::fixed(taken, 5432));

        let err = registry
            .start_if_needed(&ServiceLabel::new("Pg-vector"), &descriptor)
            .await
            .unwrap_err();

        assert!(matches!(err, ResourceError::PortConflict { port, .. } if port == taken));
    }

    struct CountingHook {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl InitHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _ctx: &HookContext<'_>) -> ResourceResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ResourceError::Runtime("extension missing".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_init_hook_runs_once() {
        let port = free_port();
        let hook = Arc::new(CountingHook {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let registry = ServiceRegistry::new(
            Arc::new(listening_runtime(port, Arc::new(AtomicUsize::new(0)))),
            &config(),
        );
        let label = ServiceLabel::new("Pg-vector");
        let descriptor =
            ServiceDescriptor::new("pgvector/pgvector:pg16", 5432).with_init_hook(hook.clone());

        registry.start_if_needed(&label, &descriptor).await.unwrap();
        registry.start_if_needed(&label, &descriptor).await.unwrap();

        assert_eq!(hook.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_hook_failure_keeps_instance_registered() {
        let port = free_port();
        let hook = Arc::new(CountingHook {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let registry = ServiceRegistry::new(
            Arc::new(listening_runtime(port, Arc::new(AtomicUsize::new(0)))),
            &config(),
        );
        let label = ServiceLabel::new("Pg-vector");
        let descriptor =
            ServiceDescriptor::new("pgvector/pgvector:pg16", 5432).with_init_hook(hook.clone());

        let err = registry.start_if_needed(&label, &descriptor).await.unwrap_err();
        match err {
            ResourceError::InitializationFailure { hook, message, .. } => {
                assert_eq!(hook, "counting");
                assert!(message.contains("extension missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.is_running(&label));

        // Reuse skips the hook even though it failed the first time
        registry.start_if_needed(&label, &descriptor).await.unwrap();
        assert_eq!(hook.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let port_a = free_port();
        let port_b = free_port();

        let mut runtime = MockContainerRuntime::new();
        let listeners = Arc::new(Mutex::new(Vec::new()));
        runtime.expect_start().times(2).returning(move |descriptor| {
            let port = if descriptor.image.starts_with("a") { port_a } else { port_b };
            listeners
                .lock()
                .unwrap()
                .push(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap());
            Ok(ContainerInfo {
                id: descriptor.image.clone(),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(80, port)]),
            })
        });
        runtime.expect_stop().times(2).returning(|_| Ok(()));

        let registry = ServiceRegistry::new(Arc::new(runtime), &config());
        registry
            .start_if_needed(&"A".into(), &ServiceDescriptor::new("a:1", 80))
            .await
            .unwrap();
        registry
            .start_if_needed(&"B".into(), &ServiceDescriptor::new("b:1", 80))
            .await
            .unwrap();
        assert_eq!(registry.labels().len(), 2);

        let stopped = registry.shutdown().await;

        assert_eq!(stopped.len(), 2);
        assert!(registry.labels().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_instance_registered() {
        let port = free_port();
        let listeners = Arc::new(Mutex::new(Vec::new()));

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_start().times(1).returning(move |_| {
            listeners
                .lock()
                .unwrap()
                .push(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap());
            Ok(ContainerInfo {
                id: "stubborn".into(),
                host: "127.0.0.1".into(),
                ports: BTreeMap::from([(5432, port)]),
            })
        });
        runtime
            .expect_stop()
            .times(1)
            .returning(|_| Err(ResourceError::Runtime("daemon unavailable".into())));
        runtime
            .expect_stop()
            .withf(|id| id == "stubborn")
            .times(1)
            .returning(|_| Ok(()));

        let registry = ServiceRegistry::new(Arc::new(runtime), &config());
        let label = ServiceLabel::new("Pg-vector");
        registry
            .start_if_needed(&label, &ServiceDescriptor::new("pgvector/pgvector:pg16", 5432))
            .await
            .unwrap();

        let err = registry.stop(&label).await.unwrap_err();
        assert!(matches!(err, ResourceError::Runtime(_)));
        assert!(registry.is_running(&label));

        // still reachable, so a later shutdown can retry it
        let stopped = registry.shutdown().await;
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].container_id, "stubborn");
        assert!(!registry.is_running(&label));
    }

    #[tokio::test]
    async fn test_stop_unknown_label_is_none() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_stop().times(0);

        let registry = ServiceRegistry::new(Arc::new(runtime), &config());
        assert!(registry.stop(&ServiceLabel::new("X")).await.unwrap().is_none());
    }
}

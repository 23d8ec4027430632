//! Static service configuration
//!
//! A [`ServiceDescriptor`] is built once (usually from the catalog) and never
//! mutated afterwards. Everything the registry, prober, provisioner and
//! exporter need to know about a service lives here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hooks::InitHook;

/// Stable name of one logical backing service (e.g. "Pg-vector", "Ollama-mini")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceLabel(String);

impl ServiceLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceLabel {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for ServiceLabel {
    fn from(label: String) -> Self {
        Self(label)
    }
}

/// Maps a container port to a host port
///
/// `host_port: Some(p)` pins the service to `p` on the host so clients
/// configured by hand keep working across runs. `None` lets the runtime pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

impl PortBinding {
    /// Fixed host port mapped to the container port
    pub fn fixed(host_port: u16, container_port: u16) -> Self {
        Self {
            container_port,
            host_port: Some(host_port),
        }
    }

    /// Host port assigned by the container runtime
    pub fn dynamic(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
        }
    }
}

/// How to tell that a started service accepts requests
///
/// Ports are container ports; the prober resolves them to host ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessCheck {
    /// A TCP connect succeeds
    PortListening { port: u16 },
    /// `GET path` answers with `status`
    Http { port: u16, path: String, status: u16 },
}

impl ReadinessCheck {
    pub fn port(port: u16) -> Self {
        ReadinessCheck::PortListening { port }
    }

    pub fn http(port: u16, path: impl Into<String>) -> Self {
        ReadinessCheck::Http {
            port,
            path: path.into(),
            status: 200,
        }
    }

    pub fn container_port(&self) -> u16 {
        match self {
            ReadinessCheck::PortListening { port } => *port,
            ReadinessCheck::Http { port, .. } => *port,
        }
    }
}

/// Username/password (and optional database) a client needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub database: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// Host directory mounted into the container as a model cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMount {
    pub host_dir: PathBuf,
    pub container_dir: String,
}

/// Where a service lists and fetches its assets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    /// HTTP model registry. `fetch_path` contains an `{id}` placeholder.
    Http {
        port: u16,
        list_path: String,
        fetch_path: String,
    },
    /// Commands executed inside the container. The asset id is appended to `pull_cmd`.
    Cli {
        list_cmd: Vec<String>,
        pull_cmd: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Log line the container must print `times` times before it counts as started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWait {
    pub stream: LogStream,
    pub message: String,
    pub times: usize,
}

impl LogWait {
    pub fn stdout(message: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            message: message.into(),
            times: 1,
        }
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            message: message.into(),
            times: 1,
        }
    }

    pub fn times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }
}

/// Names of the exported connection properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyKeys {
    /// Key prefix, e.g. `ollama` gives `ollama.host`, `ollama.port`
    pub prefix: String,
    /// URL scheme for `<prefix>.base-url`; no base URL when unset
    pub scheme: Option<String>,
    /// Container port whose host mapping is exported as `<prefix>.port`
    pub port: u16,
}

/// Immutable configuration bundle for a backing service
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub readiness: ReadinessCheck,
    /// Checked in order while the container starts, before `readiness`
    pub log_waits: Vec<LogWait>,
    /// Overrides the configured default startup window
    pub startup_timeout: Option<Duration>,
    pub credentials: Option<Credentials>,
    pub init_hook: Option<Arc<dyn InitHook>>,
    pub assets: Option<AssetSource>,
    pub cache: Option<CacheMount>,
    /// Files copied into the container before it starts (path, contents)
    pub files: Vec<(String, Vec<u8>)>,
    pub properties: PropertyKeys,
}

impl ServiceDescriptor {
    /// Start a descriptor for `image` exposing `container_port` on a runtime-assigned host port
    ///
    /// Readiness defaults to port-listening on `container_port` and properties
    /// default to prefix `service`.
    pub fn new(image: impl Into<String>, container_port: u16) -> Self {
        Self {
            image: image.into(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            ports: vec![PortBinding::dynamic(container_port)],
            readiness: ReadinessCheck::port(container_port),
            log_waits: Vec::new(),
            startup_timeout: None,
            credentials: None,
            init_hook: None,
            assets: None,
            cache: None,
            files: Vec::new(),
            properties: PropertyKeys {
                prefix: "service".to_string(),
                scheme: None,
                port: container_port,
            },
        }
    }

    /// Pin the primary container port to a fixed host port
    pub fn with_fixed_port(mut self, host_port: u16) -> Self {
        let container_port = self.properties.port;
        match self
            .ports
            .iter_mut()
            .find(|binding| binding.container_port == container_port)
        {
            Some(binding) => binding.host_port = Some(host_port),
            None => self.ports.push(PortBinding::fixed(host_port, container_port)),
        }
        self
    }

    /// Expose an extra container port
    pub fn with_port(mut self, binding: PortBinding) -> Self {
        self.ports.retain(|b| b.container_port != binding.container_port);
        self.ports.push(binding);
        self
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessCheck) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_log_wait(mut self, wait: LogWait) -> Self {
        self.log_waits.push(wait);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_init_hook(mut self, hook: Arc<dyn InitHook>) -> Self {
        self.init_hook = Some(hook);
        self
    }

    pub fn with_assets(mut self, source: AssetSource) -> Self {
        self.assets = Some(source);
        self
    }

    pub fn with_cache(mut self, host_dir: impl Into<PathBuf>, container_dir: impl Into<String>) -> Self {
        self.cache = Some(CacheMount {
            host_dir: host_dir.into(),
            container_dir: container_dir.into(),
        });
        self
    }

    pub fn with_file(mut self, container_path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((container_path.into(), contents.into()));
        self
    }

    /// Set the property prefix and base-url scheme
    pub fn with_properties(mut self, prefix: impl Into<String>, scheme: Option<&str>) -> Self {
        self.properties.prefix = prefix.into();
        self.properties.scheme = scheme.map(str::to_string);
        self
    }

    /// Fixed host ports this descriptor needs
    pub fn fixed_host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().filter_map(|binding| binding.host_port)
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("image", &self.image)
            .field("cmd", &self.cmd)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("ports", &self.ports)
            .field("readiness", &self.readiness)
            .field("log_waits", &self.log_waits)
            .field("startup_timeout", &self.startup_timeout)
            .field("init_hook", &self.init_hook.as_ref().map(|hook| hook.name()))
            .field("assets", &self.assets)
            .field("cache", &self.cache)
            .field("files", &self.files.iter().map(|(path, _)| path).collect::<Vec<_>>())
            .field("properties", &self.properties)
            .finish()
    }
}

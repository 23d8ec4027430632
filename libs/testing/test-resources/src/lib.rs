//! Shared backing services for integration tests
//!
//! This crate starts containerized services once per process, hands the
//! same instance to every test that asks for it and removes the shared
//! containers when the process exits:
//! - `ServiceRegistry`: zero-or-one running instance per service label
//! - `binder`: fail fast when a pinned host port is taken
//! - `probe`: wait until a started service answers its readiness check
//! - `AssetProvisioner`: make a model present in a service, fetching it at most once
//! - `export`: connection parameters (`<prefix>.host`, `<prefix>.port`, ...) for clients
//! - `ServiceManager`: all of the above behind one `ensure` call
//!
//! # Features
//!
//! - `postgres`: `SqlHook`, init hooks that run SQL over a real connection
//!
//! # Usage
//!
//! ```rust,no_run
//! use test_resources::{AssetId, ServiceKind, ServiceManager};
//!
//! #[tokio::test]
//! async fn transcribes() {
//!     let whisper = AssetId::parse("Systran/faster-whisper-tiny").unwrap();
//!     let params = ServiceManager::shared()
//!         .ensure_kind(ServiceKind::Speaches, &[whisper])
//!         .await
//!         .unwrap();
//!
//!     let base_url = params.get("speaches.base-url").unwrap();
//! }
//! ```
//!
//! ## Custom services
//!
//! ```rust,ignore
//! use test_resources::{ReadinessCheck, ServiceDescriptor, ServiceLabel, ServiceManager};
//!
//! let descriptor = ServiceDescriptor::new("qdrant/qdrant:v1.12.0", 6334)
//!     .with_readiness(ReadinessCheck::http(6333, "/readyz"))
//!     .with_properties("qdrant", Some("http"));
//!
//! let params = ServiceManager::shared()
//!     .ensure(&ServiceLabel::new("Qdrant"), &descriptor, &[])
//!     .await?;
//! ```

pub mod assets;
pub mod binder;
pub mod catalog;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod export;
pub mod hooks;
mod instance;
mod manager;
pub mod metrics;
pub mod probe;
mod registry;
pub mod runtime;

pub use assets::{AssetBackend, AssetId, AssetProvisioner, AssetRecord, AssetState};
pub use catalog::ServiceKind;
pub use config::ResourceConfig;
pub use descriptor::{
    AssetSource, CacheMount, Credentials, LogStream, LogWait, PortBinding, PropertyKeys, ReadinessCheck,
    ServiceDescriptor, ServiceLabel,
};
pub use error::{ResourceError, ResourceResult};
pub use export::{ConnectionParameters, PropertySink};
pub use hooks::{ExecHook, HookContext, InitHook};
pub use instance::RunningInstance;
pub use manager::ServiceManager;
pub use registry::ServiceRegistry;
pub use runtime::{ContainerInfo, ContainerRuntime, DockerRuntime, ExecOutput};

#[cfg(feature = "postgres")]
pub use hooks::SqlHook;

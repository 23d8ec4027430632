//! Known backing services
//!
//! Descriptors for the containers the integration suites run against.

use std::sync::Arc;
use std::time::Duration;

use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::config::ResourceConfig;
use crate::descriptor::{
    AssetSource, Credentials, LogWait, PortBinding, ReadinessCheck, ServiceDescriptor, ServiceLabel,
};
use crate::hooks::ExecHook;

/// Host port the vector database is pinned to
pub const PGVECTOR_HOST_PORT: u16 = 25433;

const PG_READY_LINE: &str = "database system is ready to accept connections";

const MILVUS_EMBED_ETCD: &str = "listen-client-urls: http://0.0.0.0:2379\n\
advertise-client-urls: http://0.0.0.0:2379\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum ServiceKind {
    /// PostgreSQL with the pgvector extension
    #[strum(to_string = "pgvector")]
    PgVector,
    /// Ollama inference server, models pulled through its CLI
    Ollama,
    /// Milvus standalone with embedded etcd
    Milvus,
    /// Speaches speech-to-text / text-to-speech server
    Speaches,
    /// all-MiniLM-L6-v2 sentence-transformers embedding server
    SentenceTransformers,
}

impl ServiceKind {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// Registry label shared by every suite that uses this service
    pub fn label(&self) -> ServiceLabel {
        ServiceLabel::new(match self {
            ServiceKind::PgVector => "Pg-vector",
            ServiceKind::Ollama => "Ollama-mini",
            ServiceKind::Milvus => "Milvus",
            ServiceKind::Speaches => "Speaches",
            ServiceKind::SentenceTransformers => "Sentence-transformers",
        })
    }

    /// Whether assets can be provisioned into this service
    pub fn supports_assets(&self) -> bool {
        matches!(self, ServiceKind::Ollama | ServiceKind::Speaches)
    }

    pub fn descriptor(&self, config: &ResourceConfig) -> ServiceDescriptor {
        match self {
            ServiceKind::PgVector => pgvector(),
            ServiceKind::Ollama => ollama(),
            ServiceKind::Milvus => milvus(),
            ServiceKind::Speaches => speaches(config),
            ServiceKind::SentenceTransformers => sentence_transformers(),
        }
    }
}

pub fn pgvector() -> ServiceDescriptor {
    let credentials = Credentials::new("postgres", "postgres").with_database("postgres");

    ServiceDescriptor::new("pgvector/pgvector:pg16", 5432)
        .with_fixed_port(PGVECTOR_HOST_PORT)
        .with_env("POSTGRES_USER", &credentials.username)
        .with_env("POSTGRES_PASSWORD", &credentials.password)
        .with_env("POSTGRES_DB", "postgres")
        // printed once by the temporary init server and once by the real one
        .with_log_wait(LogWait::stderr(PG_READY_LINE).times(2))
        .with_startup_timeout(Duration::from_secs(180))
        .with_init_hook(Arc::new(ExecHook::pg_extension("vector", &credentials)))
        .with_credentials(credentials)
        .with_properties("pgvector", Some("postgres"))
}

pub fn ollama() -> ServiceDescriptor {
    ServiceDescriptor::new("ollama/ollama:0.5.7", 11434)
        .with_readiness(ReadinessCheck::http(11434, "/"))
        .with_startup_timeout(Duration::from_secs(300))
        .with_assets(AssetSource::Cli {
            list_cmd: vec!["ollama".into(), "list".into()],
            pull_cmd: vec!["ollama".into(), "pull".into()],
        })
        .with_properties("ollama", Some("http"))
}

pub fn milvus() -> ServiceDescriptor {
    ServiceDescriptor::new("milvusdb/milvus:v2.4.17", 19530)
        .with_port(PortBinding::dynamic(9091))
        .with_cmd(["milvus", "run", "standalone"])
        .with_env("ETCD_USE_EMBED", "true")
        .with_env("ETCD_DATA_DIR", "/var/lib/milvus/etcd")
        .with_env("ETCD_CONFIG_PATH", "/milvus/configs/embedEtcd.yaml")
        .with_env("COMMON_STORAGETYPE", "local")
        .with_file("/milvus/configs/embedEtcd.yaml", MILVUS_EMBED_ETCD)
        .with_readiness(ReadinessCheck::http(9091, "/healthz"))
        .with_startup_timeout(Duration::from_secs(180))
        .with_properties("milvus", Some("http"))
}

pub fn speaches(config: &ResourceConfig) -> ServiceDescriptor {
    let descriptor = ServiceDescriptor::new("ghcr.io/speaches-ai/speaches:latest-cpu", 8000)
        .with_readiness(ReadinessCheck::http(8000, "/health"))
        .with_startup_timeout(Duration::from_secs(300))
        .with_assets(AssetSource::Http {
            port: 8000,
            list_path: "/v1/models".into(),
            fetch_path: "/v1/models/{id}".into(),
        })
        .with_properties("speaches", Some("http"));

    match &config.cache_dir {
        Some(dir) => descriptor.with_cache(dir.clone(), "/home/ubuntu/.cache/huggingface/hub"),
        None => descriptor,
    }
}

pub fn sentence_transformers() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "semitechnologies/transformers-inference:sentence-transformers-all-MiniLM-L6-v2",
        8080,
    )
    .with_readiness(ReadinessCheck::Http {
        port: 8080,
        path: "/.well-known/ready".into(),
        status: 204,
    })
    .with_startup_timeout(Duration::from_secs(180))
    .with_properties("transformers", Some("http"))
}

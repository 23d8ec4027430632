//! One-time post-start initialization
//!
//! The registry runs a descriptor's hook exactly once, right after the first
//! successful readiness probe. Reused instances skip it.

use async_trait::async_trait;
use tracing::info;

use crate::descriptor::Credentials;
use crate::error::{ResourceError, ResourceResult};
use crate::instance::RunningInstance;
use crate::runtime::ContainerRuntime;

/// What a hook can reach while it runs
pub struct HookContext<'a> {
    pub instance: &'a RunningInstance,
    pub runtime: &'a dyn ContainerRuntime,
    pub credentials: Option<&'a Credentials>,
}

#[async_trait]
pub trait InitHook: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    async fn run(&self, ctx: &HookContext<'_>) -> ResourceResult<()>;
}

/// Runs a fixed command inside the container and requires exit code 0
#[derive(Debug, Clone)]
pub struct ExecHook {
    name: String,
    cmd: Vec<String>,
}

impl ExecHook {
    pub fn new<I, S>(name: impl Into<String>, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            cmd: cmd.into_iter().map(Into::into).collect(),
        }
    }

    /// `CREATE EXTENSION IF NOT EXISTS <extension>` through psql inside the container
    pub fn pg_extension(extension: &str, credentials: &Credentials) -> Self {
        let database = credentials.database.as_deref().unwrap_or("postgres");
        Self::new(
            format!("pg-extension-{}", extension),
            [
                "psql".to_string(),
                "-v".to_string(),
                "ON_ERROR_STOP=1".to_string(),
                "-U".to_string(),
                credentials.username.clone(),
                "-d".to_string(),
                database.to_string(),
                "-c".to_string(),
                format!("CREATE EXTENSION IF NOT EXISTS {};", extension),
            ],
        )
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }
}

#[async_trait]
impl InitHook for ExecHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &HookContext<'_>) -> ResourceResult<()> {
        let output = ctx
            .runtime
            .exec(&ctx.instance.container_id, &self.cmd)
            .await?;

        if !output.success() {
            return Err(ResourceError::InitializationFailure {
                label: ctx.instance.label.clone(),
                hook: self.name.clone(),
                message: format!(
                    "exit code {:?}: {}",
                    output.exit_code,
                    output.combined()
                ),
            });
        }

        info!(service = %ctx.instance.label, hook = %self.name, "Init hook completed");
        Ok(())
    }
}

/// Executes SQL statements over a real connection to the published port
#[cfg(feature = "postgres")]
#[derive(Debug, Clone)]
pub struct SqlHook {
    name: String,
    container_port: u16,
    statements: Vec<String>,
}

#[cfg(feature = "postgres")]
impl SqlHook {
    pub fn new<I, S>(name: impl Into<String>, container_port: u16, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            container_port,
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }

    fn connection_string(&self, ctx: &HookContext<'_>) -> ResourceResult<String> {
        let credentials = ctx.credentials.ok_or_else(|| {
            ResourceError::Config(format!("Hook '{}' needs credentials", self.name))
        })?;
        let port = ctx.instance.host_port(self.container_port).ok_or_else(|| {
            ResourceError::Runtime(format!("Port {} is not published", self.container_port))
        })?;

        Ok(format!(
            "postgres://{}:{}@{}:{}/{}",
            credentials.username,
            credentials.password,
            ctx.instance.host,
            port,
            credentials.database.as_deref().unwrap_or("postgres")
        ))
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl InitHook for SqlHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &HookContext<'_>) -> ResourceResult<()> {
        use sea_orm::{ConnectionTrait, Database};

        let failure = |message: String| ResourceError::InitializationFailure {
            label: ctx.instance.label.clone(),
            hook: self.name.clone(),
            message,
        };

        let connection = Database::connect(self.connection_string(ctx)?)
            .await
            .map_err(|e| failure(e.to_string()))?;

        for statement in &self.statements {
            connection
                .execute_unprepared(statement)
                .await
                .map_err(|e| failure(format!("{}: {}", statement, e)))?;
        }

        info!(service = %ctx.instance.label, hook = %self.name, "SQL init hook completed");
        Ok(())
    }
}

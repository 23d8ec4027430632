use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::descriptor::ServiceLabel;
use crate::runtime::ContainerInfo;

/// Handle to a started service
///
/// Owned by the registry and handed out as `Arc<RunningInstance>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInstance {
    pub label: ServiceLabel,
    pub container_id: String,
    pub host: String,
    /// container port -> host port
    pub ports: BTreeMap<u16, u16>,
    pub started_at: DateTime<Utc>,
}

impl RunningInstance {
    pub fn new(label: ServiceLabel, container: ContainerInfo) -> Self {
        Self {
            label,
            container_id: container.id,
            host: container.host,
            ports: container.ports,
            started_at: Utc::now(),
        }
    }

    /// Host port mapped to `container_port`
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }

    /// `scheme://host:port` for a container port
    pub fn url(&self, scheme: &str, container_port: u16) -> Option<String> {
        self.host_port(container_port)
            .map(|port| format!("{}://{}:{}", scheme, self.host, port))
    }
}

//! Connection parameter export
//!
//! Turns a running instance into `<prefix>.*` keys a test or application can
//! bind to. Values are recomputed on every call and written into a
//! caller-owned sink; writing the same keys again is harmless.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::descriptor::ServiceDescriptor;
use crate::error::{ResourceError, ResourceResult};
use crate::instance::RunningInstance;

/// Anything that accepts string properties
pub trait PropertySink {
    fn set_property(&mut self, key: &str, value: String);
}

impl PropertySink for BTreeMap<String, String> {
    fn set_property(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl PropertySink for HashMap<String, String> {
    fn set_property(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// Ordered key/value view of a running service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConnectionParameters(BTreeMap<String, String>);

impl ConnectionParameters {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every parameter into `sink`
    pub fn write_to(&self, sink: &mut dyn PropertySink) {
        for (key, value) in &self.0 {
            sink.set_property(key, value.clone());
        }
    }

    /// `key=value` lines, sorted by key
    pub fn to_properties(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }
}

impl PropertySink for ConnectionParameters {
    fn set_property(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Compute the connection parameters of `instance` as described by `descriptor`
///
/// Keys: `<prefix>.host`, `<prefix>.port`, and when known `.username`,
/// `.password`, `.database`, `.base-url`.
pub fn connection_parameters(
    instance: &RunningInstance,
    descriptor: &ServiceDescriptor,
) -> ResourceResult<ConnectionParameters> {
    let keys = &descriptor.properties;
    let port = instance.host_port(keys.port).ok_or_else(|| {
        ResourceError::Runtime(format!(
            "Port {} of '{}' is not published",
            keys.port, instance.label
        ))
    })?;

    let key = |suffix: &str| format!("{}.{}", keys.prefix, suffix);
    let mut params = ConnectionParameters::default();

    params.set_property(&key("host"), instance.host.clone());
    params.set_property(&key("port"), port.to_string());

    if let Some(credentials) = &descriptor.credentials {
        params.set_property(&key("username"), credentials.username.clone());
        params.set_property(&key("password"), credentials.password.clone());
        if let Some(database) = &credentials.database {
            params.set_property(&key("database"), database.clone());
        }
    }

    if let Some(scheme) = &keys.scheme {
        params.set_property(&key("base-url"), format!("{}://{}:{}", scheme, instance.host, port));
    }

    Ok(params)
}

/// Compute the parameters and write them into `sink`
pub fn export(
    instance: &RunningInstance,
    descriptor: &ServiceDescriptor,
    sink: &mut dyn PropertySink,
) -> ResourceResult<ConnectionParameters> {
    let params = connection_parameters(instance, descriptor)?;
    params.write_to(sink);
    Ok(params)
}

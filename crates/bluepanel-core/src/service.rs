//! Boundary to the BlueZ system service.
//!
//! The transport (D-Bus proxies, signal subscriptions, marshaling) lives
//! outside this crate. It implements [`BluezService`] for outbound calls and
//! feeds inbound signals to [`DeviceModel::ingest`](crate::DeviceModel::ingest)
//! as [`ServiceEvent`](crate::ServiceEvent)s.
//!
//! Every call is asynchronous: the implementation must return promptly and
//! invoke the [`Reply`] later, exactly once, from the same thread.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::ConnectionMode;

/// BlueZ error name used when a request was withdrawn by the user.
pub const ERROR_CANCELED: &str = "org.bluez.Error.Canceled";

/// BlueZ error name used for refused requests.
pub const ERROR_REJECTED: &str = "org.bluez.Error.Rejected";

/// A loosely typed property value as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Str(s) => f.write_str(s),
            PropertyValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

/// Property dictionary (`a{sv}`), keyed by property name.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Look up a property by name, ignoring ASCII case.
pub fn property<'a>(props: &'a PropertyMap, key: &str) -> Option<&'a PropertyValue> {
    props.get(key).or_else(|| {
        props
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

/// A failure reported by the service for an outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    /// Service-defined error name, e.g. `org.bluez.Error.Failed`.
    pub name: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

impl ServiceError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for ServiceError {}

/// Completion callback for an outbound call.
pub type Reply<T> = Box<dyn FnOnce(Result<T, ServiceError>)>;

/// A device object as returned by a device listing: path plus properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceObject {
    pub path: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

/// Outbound calls to the adapter manager service.
pub trait BluezService {
    /// Read all properties of the adapter at `adapter`.
    fn adapter_properties(&self, adapter: &str, reply: Reply<PropertyMap>);

    /// List the persistent device objects known to the adapter.
    fn list_devices(&self, adapter: &str, reply: Reply<Vec<DeviceObject>>);

    fn start_discovery(&self, adapter: &str, reply: Reply<()>);

    fn stop_discovery(&self, adapter: &str, reply: Reply<()>);

    /// Write a single adapter property (`Discoverable`, `Powered`, ...).
    fn set_adapter_property(
        &self,
        adapter: &str,
        key: &str,
        value: PropertyValue,
        reply: Reply<()>,
    );

    /// Create and pair a device object, using the agent registered at
    /// `agent_path`. Replies with the new device object path.
    fn create_paired_device(
        &self,
        adapter: &str,
        address: &str,
        agent_path: &str,
        capability: &str,
        reply: Reply<String>,
    );

    fn remove_device(&self, adapter: &str, path: &str, reply: Reply<()>);

    fn connect_device(&self, address: &str, mode: ConnectionMode, reply: Reply<()>);

    fn disconnect_device(&self, address: &str, reply: Reply<()>);
}

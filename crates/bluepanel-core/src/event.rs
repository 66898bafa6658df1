//! Inbound notifications from the service.

use serde::{Deserialize, Serialize};

use crate::service::{PropertyMap, PropertyValue};

/// One signal from the adapter manager service, already unmarshaled by the
/// transport. Events must be ingested in the order the service sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEvent {
    /// The service reports a (new) default adapter.
    AdapterAvailable { path: String },
    AdapterRemoved { path: String },
    AdapterPropertyChanged { key: String, value: PropertyValue },
    /// The service dropped off the bus.
    ServiceLost,
    /// A scan saw a device.
    DeviceFound {
        address: String,
        #[serde(default)]
        properties: PropertyMap,
    },
    /// A scan stopped seeing a device.
    DeviceDisappeared { address: String },
    /// A persistent device object appeared.
    DeviceCreated {
        path: String,
        #[serde(default)]
        properties: PropertyMap,
    },
    DeviceRemoved { path: String },
    DevicePropertyChanged {
        path: String,
        key: String,
        value: PropertyValue,
    },
}

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use bluepanel_core::{
    BluetoothPanel, Config, DeviceModel, ManualScheduler, PropertyMap, PropertyValue,
    ReplyValue, ScriptedService, ServiceEvent,
};

pub const ADAPTER: &str = "/org/bluez/hci0";
pub const HEADSET: &str = "AA:BB:CC:DD:EE:FF";
pub const KEYBOARD: &str = "11:22:33:44:55:66";

pub fn props(entries: &[(&str, PropertyValue)]) -> PropertyMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// BlueZ-style object path for `address` under the test adapter.
pub fn device_path(address: &str) -> String {
    format!("{}/dev_{}", ADAPTER, address.replace(':', "_"))
}

/// A panel wired to a scripted service and a virtual clock.
pub struct Harness {
    pub service: Rc<ScriptedService>,
    pub scheduler: Rc<ManualScheduler>,
    pub panel: Rc<BluetoothPanel>,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = Config::default();
        // Most scenarios don't want discovery toggling underneath them.
        config.scan.cycle = false;
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Self {
        let service = Rc::new(ScriptedService::new());
        let scheduler = Rc::new(ManualScheduler::new());
        let panel = BluetoothPanel::new(service.clone(), scheduler.clone(), config);
        Self {
            service,
            scheduler,
            panel,
        }
    }

    pub fn model(&self) -> &Rc<DeviceModel> {
        self.panel.model()
    }

    pub fn ingest(&self, event: ServiceEvent) {
        self.panel.ingest(event);
    }

    /// Bind the test adapter, answering its property read and an empty
    /// device listing.
    pub fn bind(&self, adapter_props: &[(&str, PropertyValue)]) {
        self.ingest(ServiceEvent::AdapterAvailable {
            path: ADAPTER.to_string(),
        });
        self.service
            .complete(
                "adapter_properties",
                Ok(ReplyValue::Properties(props(adapter_props))),
            )
            .unwrap();
        self.service
            .complete("list_devices", Ok(ReplyValue::Devices(Vec::new())))
            .unwrap();
    }

    /// Bind a powered adapter called "hci0".
    pub fn bind_powered(&self) {
        self.bind(&[
            ("Name", "hci0".into()),
            ("Address", "00:11:22:33:44:55".into()),
            ("Powered", true.into()),
            ("Pairable", true.into()),
        ]);
    }

    pub fn found(&self, address: &str, entries: &[(&str, PropertyValue)]) {
        self.ingest(ServiceEvent::DeviceFound {
            address: address.to_string(),
            properties: props(entries),
        });
    }

    pub fn created(&self, address: &str, entries: &[(&str, PropertyValue)]) {
        let mut properties = props(entries);
        properties.insert("Address".to_string(), address.into());
        self.ingest(ServiceEvent::DeviceCreated {
            path: device_path(address),
            properties,
        });
    }

    pub fn property_changed(&self, address: &str, key: &str, value: PropertyValue) {
        self.ingest(ServiceEvent::DevicePropertyChanged {
            path: device_path(address),
            key: key.to_string(),
            value,
        });
    }

    /// Arguments of every `set_adapter_property` call so far.
    pub fn property_writes(&self) -> Vec<Vec<String>> {
        self.service
            .calls_to("set_adapter_property")
            .into_iter()
            .map(|c| c.args)
            .collect()
    }
}

/// Collect everything a listener receives.
pub fn record<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(&T) + 'static) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    (events, move |e: &T| sink.borrow_mut().push(e.clone()))
}

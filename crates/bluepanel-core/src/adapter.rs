//! Local adapter state.

use serde::Serialize;
use tracing::{trace, warn};

use crate::service::{PropertyMap, PropertyValue};

/// Snapshot of the bound adapter. All flags are false while unbound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Adapter {
    pub name: String,
    pub address: String,
    pub powered: bool,
    pub discoverable: bool,
    pub discovering: bool,
    pub pairable: bool,
}

/// A confirmed change of one adapter attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterChange {
    Name(String),
    Address(String),
    Powered(bool),
    Discoverable(bool),
    Discovering(bool),
    Pairable(bool),
}

impl Adapter {
    /// Apply a property map, returning only the attributes that changed.
    pub fn apply_properties(&mut self, props: &PropertyMap) -> Vec<AdapterChange> {
        props
            .iter()
            .filter_map(|(key, value)| self.update_property(key, value))
            .collect()
    }

    /// Apply one property. Unknown keys and mistyped values are ignored.
    pub fn update_property(&mut self, key: &str, value: &PropertyValue) -> Option<AdapterChange> {
        let key = key.to_ascii_lowercase();
        match key.as_str() {
            "name" | "alias" => {
                let name = string_value(&key, value)?;
                (self.name != name).then(|| {
                    self.name = name.to_string();
                    AdapterChange::Name(self.name.clone())
                })
            }
            "address" => {
                let address = string_value(&key, value)?;
                (self.address != address).then(|| {
                    self.address = address.to_string();
                    AdapterChange::Address(self.address.clone())
                })
            }
            "powered" => flag(&mut self.powered, &key, value).map(AdapterChange::Powered),
            "discoverable" => {
                flag(&mut self.discoverable, &key, value).map(AdapterChange::Discoverable)
            }
            "discovering" => {
                flag(&mut self.discovering, &key, value).map(AdapterChange::Discovering)
            }
            "pairable" => flag(&mut self.pairable, &key, value).map(AdapterChange::Pairable),
            _ => {
                trace!("Adapter: ignoring property {}", key);
                None
            }
        }
    }

    /// Reset to the unbound state, returning the flags that flipped.
    pub fn reset(&mut self) -> Vec<AdapterChange> {
        let old = std::mem::take(self);
        let mut changes = Vec::new();
        if !old.name.is_empty() {
            changes.push(AdapterChange::Name(String::new()));
        }
        if !old.address.is_empty() {
            changes.push(AdapterChange::Address(String::new()));
        }
        if old.powered {
            changes.push(AdapterChange::Powered(false));
        }
        if old.discoverable {
            changes.push(AdapterChange::Discoverable(false));
        }
        if old.discovering {
            changes.push(AdapterChange::Discovering(false));
        }
        if old.pairable {
            changes.push(AdapterChange::Pairable(false));
        }
        changes
    }
}

fn string_value<'a>(key: &str, value: &'a PropertyValue) -> Option<&'a str> {
    let s = value.as_str();
    if s.is_none() {
        warn!("Adapter: ignoring malformed property {} = {:?}", key, value);
    }
    s
}

fn flag(slot: &mut bool, key: &str, value: &PropertyValue) -> Option<bool> {
    let Some(new) = value.as_bool() else {
        warn!("Adapter: ignoring malformed property {} = {:?}", key, value);
        return None;
    };
    if *slot == new {
        return None;
    }
    *slot = new;
    Some(new)
}

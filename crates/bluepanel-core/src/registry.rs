//! Address-keyed, insertion-ordered device collection.
//!
//! Rows keep discovery order so row indices stay stable for the
//! presentation layer. Every mutating method returns the [`RowChange`] it
//! caused (or `None` for a no-op) and leaves notification to the owner.
//!
//! Invariants:
//! - an address appears at most once;
//! - a row that has a service path never loses it.

use tracing::{debug, warn};

use crate::device::Device;
use crate::service::{PropertyMap, PropertyValue, property};

/// A row-level mutation of the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    /// A row was appended at this index.
    Inserted(usize),
    /// The row at this index was removed; later rows shifted down by one.
    Removed { row: usize, device: Device },
    /// The row at this index changed in place.
    Changed(usize),
    /// Every row was dropped.
    Reset,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&Device> {
        self.devices.get(row)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn find_row_from_address(&self, address: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.address == address)
    }

    pub fn find_row_from_path(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            return None;
        }
        self.devices.iter().position(|d| d.path == path)
    }

    pub fn device_from_address(&self, address: &str) -> Option<&Device> {
        self.find_row_from_address(address).map(|row| &self.devices[row])
    }

    pub fn device_from_path(&self, path: &str) -> Option<&Device> {
        self.find_row_from_path(path).map(|row| &self.devices[row])
    }

    /// A scan sighting: insert the address if unseen, otherwise merge the
    /// reported properties into the existing row (path or not).
    pub fn found(&mut self, address: &str, props: &PropertyMap) -> Option<RowChange> {
        if address.is_empty() {
            warn!("DeviceRegistry: ignoring sighting without an address");
            return None;
        }

        match self.find_row_from_address(address) {
            Some(row) => self.devices[row]
                .merge_properties(props)
                .then_some(RowChange::Changed(row)),
            None => {
                let mut device = Device::new(address);
                device.merge_properties(props);
                Some(self.push(device))
            }
        }
    }

    /// A scan lost sight of `address`. Only path-less rows are dropped.
    pub fn disappeared(&mut self, address: &str) -> Option<RowChange> {
        let row = self.find_row_from_address(address)?;
        if self.devices[row].has_path() {
            debug!(
                "DeviceRegistry: keeping {} out of range, it has a persistent object",
                address
            );
            return None;
        }
        Some(self.remove_row(row))
    }

    /// The service created a persistent object at `path`.
    ///
    /// Resolves by path first, then by the reported address (adopting a
    /// scan-only row), and inserts only when neither matches.
    pub fn created(&mut self, path: &str, props: &PropertyMap) -> Option<RowChange> {
        if let Some(row) = self.find_row_from_path(path) {
            return self.devices[row]
                .merge_properties(props)
                .then_some(RowChange::Changed(row));
        }

        let Some(address) = property(props, "Address").and_then(|v| v.as_str()) else {
            warn!("DeviceRegistry: device {} created without an address", path);
            return None;
        };

        match self.find_row_from_address(address) {
            Some(row) => {
                let device = &mut self.devices[row];
                if device.has_path() {
                    warn!(
                        "DeviceRegistry: {} moved from {} to {}",
                        address, device.path, path
                    );
                }
                device.path = path.to_string();
                device.merge_properties(props);
                Some(RowChange::Changed(row))
            }
            None => Device::from_properties(path, props).map(|device| self.push(device)),
        }
    }

    /// Record that `address` now has the persistent object `path`, as
    /// confirmed by a create request.
    pub fn attach_path(&mut self, address: &str, path: &str) -> Option<RowChange> {
        if path.is_empty() {
            return None;
        }
        if self.find_row_from_path(path).is_some() {
            return None;
        }

        match self.find_row_from_address(address) {
            Some(row) => {
                self.devices[row].path = path.to_string();
                Some(RowChange::Changed(row))
            }
            None => {
                let mut device = Device::new(address);
                device.path = path.to_string();
                Some(self.push(device))
            }
        }
    }

    /// The persistent object at `path` is gone.
    pub fn remove_path(&mut self, path: &str) -> Option<RowChange> {
        let row = self.find_row_from_path(path)?;
        Some(self.remove_row(row))
    }

    /// Apply a single property change to the device at `path`.
    pub fn update_property(
        &mut self,
        path: &str,
        key: &str,
        value: &PropertyValue,
    ) -> Option<RowChange> {
        let row = self.find_row_from_path(path)?;
        self.devices[row]
            .update_property(key, value)
            .then_some(RowChange::Changed(row))
    }

    /// Drop every signal strength reading. Readings only mean something
    /// while a scan is running.
    pub fn clear_signal_strength(&mut self) -> Vec<RowChange> {
        self.devices
            .iter_mut()
            .enumerate()
            .filter_map(|(row, device)| device.rssi.take().map(|_| RowChange::Changed(row)))
            .collect()
    }

    pub fn clear(&mut self) -> Option<RowChange> {
        if self.devices.is_empty() {
            return None;
        }
        self.devices.clear();
        Some(RowChange::Reset)
    }

    fn push(&mut self, device: Device) -> RowChange {
        self.devices.push(device);
        RowChange::Inserted(self.devices.len() - 1)
    }

    fn remove_row(&mut self, row: usize) -> RowChange {
        let device = self.devices.remove(row);
        RowChange::Removed { row, device }
    }
}

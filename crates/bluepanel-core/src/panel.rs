//! BluetoothPanel - the object a settings panel binds to.
//!
//! Owns the device model, the pairing agent and the two device lists the
//! panel shows (connected and disconnected), tracks the selected device and
//! turns "connect this device" into either a direct connect or a
//! create-then-connect.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, info};

use crate::adapter::AdapterChange;
use crate::agent::{Agent, AgentEvent, AgentSettings};
use crate::callbacks::{CallbackId, Callbacks};
use crate::config::Config;
use crate::device::{Connection, ConnectionMode, Device};
use crate::error::{Error, Result};
use crate::event::ServiceEvent;
use crate::filter::{DeviceFilter, FilteredView, SortOrder};
use crate::model::{DeviceModel, ModelEvent, ModelSettings};
use crate::registry::RowChange;
use crate::service::BluezService;
use crate::timer::Scheduler;

/// Notifications published by the panel.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    /// The selection changed, or the selected device did. Carries the
    /// device as currently resolved.
    SelectedDeviceChanged(Option<Device>),
    DiscoveringChanged(bool),
    DiscoverableChanged(bool),
    PoweredChanged(bool),
    AdapterNameChanged(String),
}

pub struct BluetoothPanel {
    model: Rc<DeviceModel>,
    agent: Rc<Agent>,
    connected: Rc<FilteredView>,
    disconnected: Rc<FilteredView>,
    /// Address of the selected device.
    selected: RefCell<Option<String>>,
    model_subscription: Cell<Option<CallbackId>>,
    agent_subscription: Cell<Option<CallbackId>>,
    callbacks: Callbacks<PanelEvent>,
}

impl BluetoothPanel {
    pub fn new(
        service: Rc<dyn BluezService>,
        scheduler: Rc<dyn Scheduler>,
        config: &Config,
    ) -> Rc<Self> {
        let model = DeviceModel::new(
            service,
            scheduler.clone(),
            ModelSettings::from_config(config),
        );
        let agent = Agent::new(&model, scheduler, AgentSettings::from_config(config));

        // Views subscribe first so they are in sync before the panel reacts.
        let connected = FilteredView::attach(
            "connected",
            &model,
            DeviceFilter::new(SortOrder::Connection).with_connections([
                Connection::Connected,
                Connection::Connecting,
                Connection::Disconnecting,
            ]),
        );
        let disconnected = FilteredView::attach(
            "disconnected",
            &model,
            DeviceFilter::new(SortOrder::Name).with_connections([Connection::Disconnected]),
        );

        let panel = Rc::new(Self {
            model,
            agent,
            connected,
            disconnected,
            selected: RefCell::new(None),
            model_subscription: Cell::new(None),
            agent_subscription: Cell::new(None),
            callbacks: Callbacks::new(),
        });

        let panel_weak: Weak<Self> = Rc::downgrade(&panel);
        let id = panel.model.connect(move |event| {
            if let Some(panel) = panel_weak.upgrade() {
                panel.on_model_event(event);
            }
        });
        panel.model_subscription.set(Some(id));

        let panel_weak: Weak<Self> = Rc::downgrade(&panel);
        let id = panel.agent.connect(move |event| {
            if let Some(panel) = panel_weak.upgrade() {
                panel.on_agent_event(event);
            }
        });
        panel.agent_subscription.set(Some(id));

        panel
    }

    pub fn connect<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&PanelEvent) + 'static,
    {
        self.callbacks.register(callback)
    }

    pub fn disconnect(&self, id: CallbackId) -> bool {
        self.callbacks.unregister(id)
    }

    pub fn model(&self) -> &Rc<DeviceModel> {
        &self.model
    }

    pub fn agent(&self) -> &Rc<Agent> {
        &self.agent
    }

    /// Devices with a live or transitioning link, connected first.
    pub fn connected_devices(&self) -> &Rc<FilteredView> {
        &self.connected
    }

    /// Idle devices, by name.
    pub fn disconnected_devices(&self) -> &Rc<FilteredView> {
        &self.disconnected
    }

    pub fn ingest(&self, event: ServiceEvent) {
        self.model.ingest(event);
    }

    pub fn adapter_name(&self) -> String {
        self.model.adapter_name()
    }

    pub fn is_discovering(&self) -> bool {
        self.model.is_discovering()
    }

    pub fn is_discoverable(&self) -> bool {
        self.model.is_discoverable()
    }

    pub fn is_powered(&self) -> bool {
        self.model.is_powered()
    }

    // Selection

    /// Select the device with `address`, or clear the selection.
    pub fn set_selected_device(&self, address: Option<&str>) {
        let changed = {
            let mut selected = self.selected.borrow_mut();
            let changed = selected.as_deref() != address;
            *selected = address.map(str::to_string);
            changed
        };
        if changed {
            debug!("BluetoothPanel: selected {:?}", address);
            self.emit_selected();
        }
    }

    /// The selected device, if it is still in the registry.
    pub fn selected_device(&self) -> Option<Device> {
        let address = self.selected.borrow().clone()?;
        self.model.device_from_address(&address)
    }

    pub fn selected_address(&self) -> Option<String> {
        self.selected.borrow().clone()
    }

    // Actions

    /// Connect `address` with the profile its type calls for.
    ///
    /// A paired device with a service object is connected directly. Anything
    /// else is created (and paired) first, with a connect queued for when
    /// the create succeeds. Devices whose type has no profile are only
    /// paired.
    pub fn connect_device(&self, address: &str) -> Result<()> {
        let device = self
            .model
            .device_from_address(address)
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))?;
        let mode = ConnectionMode::for_type(device.device_type);

        if device.paired && device.has_path() {
            let mode = mode.ok_or(Error::NoConnectionMode(device.device_type))?;
            return self.model.connect_device(address, mode);
        }

        match mode {
            Some(mode) => self.model.add_connect_after_pairing(address, mode),
            None => info!(
                "BluetoothPanel: pairing {} without connecting ({} has no profile)",
                address, device.device_type
            ),
        }

        if let Err(e) = self.model.create_device(address, &self.agent) {
            // An outstanding create keeps the queued intent.
            if !matches!(e, Error::AlreadyPending(_)) {
                self.model.discard_connect_intent(address);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Disconnect the selected device.
    pub fn disconnect_device(&self) -> Result<()> {
        let address = self
            .selected
            .borrow()
            .clone()
            .ok_or(Error::NoSelection)?;
        self.model.disconnect_device(&address)
    }

    /// Forget the selected device.
    pub fn remove_device(&self) -> Result<()> {
        let address = self.selected.borrow().clone().ok_or(Error::NoSelection)?;
        let device = self
            .model
            .device_from_address(&address)
            .ok_or(Error::DeviceNotFound(address))?;
        self.model.remove_device(&device.path)
    }

    // Notifications

    fn emit_selected(&self) {
        let device = self.selected_device();
        self.callbacks
            .notify(&PanelEvent::SelectedDeviceChanged(device));
    }

    fn is_selected(&self, address: &str) -> bool {
        self.selected.borrow().as_deref() == Some(address)
    }

    fn on_model_event(&self, event: &ModelEvent) {
        match event {
            ModelEvent::Adapter(change) => {
                let event = match change {
                    AdapterChange::Discovering(v) => PanelEvent::DiscoveringChanged(*v),
                    AdapterChange::Discoverable(v) => PanelEvent::DiscoverableChanged(*v),
                    AdapterChange::Powered(v) => PanelEvent::PoweredChanged(*v),
                    AdapterChange::Name(name) => PanelEvent::AdapterNameChanged(name.clone()),
                    AdapterChange::Address(_) | AdapterChange::Pairable(_) => return,
                };
                self.callbacks.notify(&event);
            }
            ModelEvent::Row(RowChange::Inserted(row) | RowChange::Changed(row)) => {
                let hit = self
                    .model
                    .with_registry(|r| r.get(*row).is_some_and(|d| self.is_selected(&d.address)));
                if hit {
                    self.emit_selected();
                }
            }
            ModelEvent::Row(RowChange::Removed { device, .. }) => {
                if self.is_selected(&device.address) {
                    self.emit_selected();
                }
            }
            ModelEvent::Row(RowChange::Reset) => {
                if self.selected.borrow().is_some() {
                    self.emit_selected();
                }
            }
            _ => {}
        }
    }

    fn on_agent_event(&self, event: &AgentEvent) {
        // Pairing state feeds the selected device's details.
        if matches!(event, AgentEvent::PromptEnded(_) | AgentEvent::Released)
            && self.selected.borrow().is_some()
        {
            self.emit_selected();
        }
    }
}

impl Drop for BluetoothPanel {
    fn drop(&mut self) {
        if let Some(id) = self.model_subscription.take() {
            self.model.disconnect(id);
        }
        if let Some(id) = self.agent_subscription.take() {
            self.agent.disconnect(id);
        }
    }
}

//! DeviceModel - adapter lifecycle plus the device registry.
//!
//! This is the coordinator between the BlueZ service and everything that
//! displays devices. It provides:
//!   - binding to a single adapter, rebinding when the service says so
//!   - adapter flags (powered, discoverable, discovering, pairable) that
//!     only ever reflect what the service confirmed
//!   - ordered ingestion of service events into the [`DeviceRegistry`]
//!   - create/remove/connect requests, with post-pairing connect intents
//!   - the discoverable auto-revert timer and the scan cycle timer
//!
//! Every completion closure holds a `Weak` to the model and the adapter
//! binding generation it was issued under. Completions that arrive after
//! the model is gone or the adapter was rebound are dropped.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::adapter::{Adapter, AdapterChange};
use crate::agent::Agent;
use crate::callbacks::{CallbackId, Callbacks};
use crate::config::Config;
use crate::device::{ConnectionMode, Device};
use crate::error::{Error, Result};
use crate::event::ServiceEvent;
use crate::registry::{DeviceRegistry, RowChange};
use crate::service::{BluezService, DeviceObject, PropertyMap, ServiceError};
use crate::timer::{DelayedTask, Scheduler};

/// Timing knobs for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    /// How long the adapter stays discoverable after `try_set_discoverable(true)`.
    pub discoverable_timeout: Duration,
    /// Scan-cycle durations (active, idle); `None` disables cycling.
    pub scan_cycle: Option<(Duration, Duration)>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            discoverable_timeout: Duration::from_secs(120),
            scan_cycle: Some((Duration::from_secs(10), Duration::from_secs(10))),
        }
    }
}

impl ModelSettings {
    pub fn from_config(config: &Config) -> Self {
        let scan = &config.scan;
        Self {
            discoverable_timeout: Duration::from_secs(config.adapter.discoverable_timeout_secs),
            scan_cycle: scan.cycle.then(|| {
                (
                    Duration::from_secs(scan.active_secs),
                    Duration::from_secs(scan.idle_secs),
                )
            }),
        }
    }
}

/// Notifications published by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A confirmed change of the adapter state.
    Adapter(AdapterChange),
    /// A registry row changed.
    Row(RowChange),
    CreateFailed { address: String, error: ServiceError },
    RemoveFailed { path: String, error: ServiceError },
    ConnectFailed { address: String, error: ServiceError },
    DisconnectFailed { address: String, error: ServiceError },
}

struct AdapterBinding {
    path: String,
    generation: u64,
}

pub struct DeviceModel {
    service: Rc<dyn BluezService>,
    settings: ModelSettings,
    weak_self: Weak<DeviceModel>,
    /// The adapter we are bound to, if any.
    binding: RefCell<Option<AdapterBinding>>,
    next_generation: Cell<u64>,
    adapter: RefCell<Adapter>,
    registry: RefCell<DeviceRegistry>,
    /// Address -> profile to connect once the create request succeeds.
    connect_after_pairing: RefCell<HashMap<String, ConnectionMode>>,
    pending_creates: RefCell<HashSet<String>>,
    pending_removals: RefCell<HashSet<String>>,
    /// Bumped by every discoverable request; only the latest may arm the
    /// revert timer.
    discoverable_request: Cell<u64>,
    discoverable_timer: DelayedTask,
    scan_timer: DelayedTask,
    callbacks: Callbacks<ModelEvent>,
}

impl DeviceModel {
    pub fn new(
        service: Rc<dyn BluezService>,
        scheduler: Rc<dyn Scheduler>,
        settings: ModelSettings,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            service,
            settings,
            weak_self: weak_self.clone(),
            binding: RefCell::new(None),
            next_generation: Cell::new(1),
            adapter: RefCell::new(Adapter::default()),
            registry: RefCell::new(DeviceRegistry::new()),
            connect_after_pairing: RefCell::new(HashMap::new()),
            pending_creates: RefCell::new(HashSet::new()),
            pending_removals: RefCell::new(HashSet::new()),
            discoverable_request: Cell::new(0),
            discoverable_timer: DelayedTask::new("discoverable-timeout", scheduler.clone()),
            scan_timer: DelayedTask::new("scan-cycle", scheduler),
            callbacks: Callbacks::new(),
        })
    }

    /// Register a listener for model notifications.
    pub fn connect<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ModelEvent) + 'static,
    {
        self.callbacks.register(callback)
    }

    pub fn disconnect(&self, id: CallbackId) -> bool {
        self.callbacks.unregister(id)
    }

    // Queries

    pub fn adapter(&self) -> Adapter {
        self.adapter.borrow().clone()
    }

    /// Object path of the bound adapter.
    pub fn adapter_path(&self) -> Option<String> {
        self.binding.borrow().as_ref().map(|b| b.path.clone())
    }

    pub fn adapter_name(&self) -> String {
        self.adapter.borrow().name.clone()
    }

    pub fn is_powered(&self) -> bool {
        self.adapter.borrow().powered
    }

    pub fn is_discovering(&self) -> bool {
        self.adapter.borrow().discovering
    }

    pub fn is_discoverable(&self) -> bool {
        self.adapter.borrow().discoverable
    }

    pub fn is_pairable(&self) -> bool {
        self.adapter.borrow().pairable
    }

    pub fn row_count(&self) -> usize {
        self.registry.borrow().len()
    }

    pub fn device_at(&self, row: usize) -> Option<Device> {
        self.registry.borrow().get(row).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.borrow().devices().to_vec()
    }

    pub fn device_from_address(&self, address: &str) -> Option<Device> {
        self.registry.borrow().device_from_address(address).cloned()
    }

    pub fn device_from_path(&self, path: &str) -> Option<Device> {
        self.registry.borrow().device_from_path(path).cloned()
    }

    /// Read the registry without cloning. `f` must not call back into the
    /// model's mutating operations.
    pub fn with_registry<R>(&self, f: impl FnOnce(&DeviceRegistry) -> R) -> R {
        f(&self.registry.borrow())
    }

    pub fn connect_intent(&self, address: &str) -> Option<ConnectionMode> {
        self.connect_after_pairing.borrow().get(address).copied()
    }

    pub fn is_discoverable_timer_armed(&self) -> bool {
        self.discoverable_timer.is_armed()
    }

    // Event ingestion

    /// Apply one service event. Events must arrive in service order.
    pub fn ingest(&self, event: ServiceEvent) {
        debug!("DeviceModel: {:?}", event);

        match event {
            ServiceEvent::AdapterAvailable { path } => self.adapter_available(&path),
            ServiceEvent::AdapterRemoved { path } => self.adapter_removed(&path),
            ServiceEvent::ServiceLost => self.service_lost(),
            ServiceEvent::AdapterPropertyChanged { key, value } => {
                if self.binding.borrow().is_none() {
                    debug!("DeviceModel: adapter property {} without an adapter", key);
                    return;
                }
                let change = self.adapter.borrow_mut().update_property(&key, &value);
                self.apply_adapter_changes(change.into_iter().collect());
            }
            ServiceEvent::DeviceFound {
                address,
                properties,
            } => {
                if self.require_adapter("DeviceFound") {
                    self.mutate_registry(|r| r.found(&address, &properties));
                }
            }
            ServiceEvent::DeviceDisappeared { address } => {
                if self.require_adapter("DeviceDisappeared") {
                    self.mutate_registry(|r| r.disappeared(&address));
                }
            }
            ServiceEvent::DeviceCreated { path, properties } => {
                if self.require_adapter("DeviceCreated") {
                    self.mutate_registry(|r| r.created(&path, &properties));
                }
            }
            ServiceEvent::DeviceRemoved { path } => {
                if self.require_adapter("DeviceRemoved") {
                    self.mutate_registry(|r| r.remove_path(&path));
                }
            }
            ServiceEvent::DevicePropertyChanged { path, key, value } => {
                if self.require_adapter("DevicePropertyChanged") {
                    self.mutate_registry(|r| r.update_property(&path, &key, &value));
                }
            }
        }
    }

    fn require_adapter(&self, what: &str) -> bool {
        let bound = self.binding.borrow().is_some();
        if !bound {
            debug!("DeviceModel: ignoring {} without an adapter", what);
        }
        bound
    }

    // Adapter lifecycle

    /// Bind to the adapter at `path`, releasing any previous binding.
    pub fn adapter_available(&self, path: &str) {
        if self.adapter_path().as_deref() == Some(path) {
            debug!("DeviceModel: already bound to {}", path);
            return;
        }
        if self.binding.borrow().is_some() {
            self.unbind();
        }

        let generation = self.next_generation.get();
        self.next_generation.set(generation + 1);
        *self.binding.borrow_mut() = Some(AdapterBinding {
            path: path.to_string(),
            generation,
        });
        info!("DeviceModel: bound to adapter {}", path);

        let this_weak = self.weak_self.clone();
        self.service.adapter_properties(
            path,
            Box::new(move |res| {
                if let Some(this) = this_weak.upgrade() {
                    this.on_adapter_properties(generation, res);
                }
            }),
        );

        let this_weak = self.weak_self.clone();
        self.service.list_devices(
            path,
            Box::new(move |res| {
                if let Some(this) = this_weak.upgrade() {
                    this.on_device_list(generation, res);
                }
            }),
        );
    }

    /// The service dropped the adapter at `path`.
    pub fn adapter_removed(&self, path: &str) {
        if self.adapter_path().as_deref() != Some(path) {
            debug!("DeviceModel: ignoring removal of unbound adapter {}", path);
            return;
        }
        info!("DeviceModel: adapter {} removed", path);
        self.unbind();
    }

    /// The service itself went away.
    pub fn service_lost(&self) {
        if self.binding.borrow().is_some() {
            warn!("DeviceModel: service lost, dropping adapter");
            self.unbind();
        }
    }

    fn unbind(&self) {
        self.binding.borrow_mut().take();
        self.discoverable_timer.disarm();
        self.scan_timer.disarm();
        self.connect_after_pairing.borrow_mut().clear();
        self.pending_creates.borrow_mut().clear();
        self.pending_removals.borrow_mut().clear();

        let changes = self.adapter.borrow_mut().reset();
        for change in changes {
            self.callbacks.notify(&ModelEvent::Adapter(change));
        }
        self.mutate_registry(DeviceRegistry::clear);
    }

    fn current_adapter(&self) -> Result<(String, u64)> {
        self.binding
            .borrow()
            .as_ref()
            .map(|b| (b.path.clone(), b.generation))
            .ok_or(Error::NoAdapter)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.binding
            .borrow()
            .as_ref()
            .is_some_and(|b| b.generation == generation)
    }

    fn on_adapter_properties(
        &self,
        generation: u64,
        res: std::result::Result<PropertyMap, ServiceError>,
    ) {
        if !self.is_current(generation) {
            debug!("DeviceModel: dropping adapter properties for a stale binding");
            return;
        }

        match res {
            Ok(props) => {
                let changes = self.adapter.borrow_mut().apply_properties(&props);
                self.apply_adapter_changes(changes);
                self.restart_scan_timer();
            }
            Err(e) => error!("DeviceModel: failed to read adapter properties: {}", e),
        }
    }

    fn on_device_list(
        &self,
        generation: u64,
        res: std::result::Result<Vec<DeviceObject>, ServiceError>,
    ) {
        if !self.is_current(generation) {
            debug!("DeviceModel: dropping device list for a stale binding");
            return;
        }

        match res {
            Ok(objects) => {
                debug!("DeviceModel: adapter has {} device(s)", objects.len());
                for object in objects {
                    self.mutate_registry(|r| r.created(&object.path, &object.properties));
                }
                if !self.is_discovering() {
                    self.clear_signal_strength();
                }
            }
            Err(e) => error!("DeviceModel: failed to list devices: {}", e),
        }
    }

    fn apply_adapter_changes(&self, changes: Vec<AdapterChange>) {
        for change in changes {
            match change {
                AdapterChange::Discovering(_) | AdapterChange::Powered(_) => {
                    self.restart_scan_timer();
                }
                AdapterChange::Discoverable(false) => self.discoverable_timer.disarm(),
                _ => {}
            }
            let scan_stopped = change == AdapterChange::Discovering(false);
            self.callbacks.notify(&ModelEvent::Adapter(change));
            if scan_stopped {
                self.clear_signal_strength();
            }
        }
    }

    fn clear_signal_strength(&self) {
        let changes = self.registry.borrow_mut().clear_signal_strength();
        for change in changes {
            self.callbacks.notify(&ModelEvent::Row(change));
        }
    }

    fn mutate_registry<F>(&self, f: F)
    where
        F: FnOnce(&mut DeviceRegistry) -> Option<RowChange>,
    {
        let change = f(&mut self.registry.borrow_mut());
        if let Some(change) = change {
            self.callbacks.notify(&ModelEvent::Row(change));
        }
    }

    // Adapter control

    pub fn start_discovery(&self) -> Result<()> {
        let (adapter, _) = self.current_adapter()?;
        debug!("DeviceModel: starting discovery on {}", adapter);
        self.service.start_discovery(
            &adapter,
            Box::new(|res| {
                if let Err(e) = res {
                    error!("DeviceModel: StartDiscovery failed: {}", e);
                }
            }),
        );
        Ok(())
    }

    pub fn stop_discovery(&self) -> Result<()> {
        let (adapter, _) = self.current_adapter()?;
        debug!("DeviceModel: stopping discovery on {}", adapter);
        self.service.stop_discovery(
            &adapter,
            Box::new(|res| {
                if let Err(e) = res {
                    // Fails when discovery already ended on its own.
                    debug!("DeviceModel: StopDiscovery: {}", e);
                }
            }),
        );
        Ok(())
    }

    pub fn toggle_discovery(&self) -> Result<()> {
        if self.is_discovering() {
            self.stop_discovery()
        } else {
            self.start_discovery()
        }
    }

    /// Ask the service to change discoverability.
    ///
    /// Once the service accepts `true`, a timer requests `false` after the
    /// configured timeout. Asking again restarts that timer; asking for
    /// `false` cancels it.
    pub fn try_set_discoverable(&self, discoverable: bool) -> Result<()> {
        let (adapter, generation) = self.current_adapter()?;
        let request = self.discoverable_request.get() + 1;
        self.discoverable_request.set(request);
        if !discoverable {
            self.discoverable_timer.disarm();
        }

        let this_weak = self.weak_self.clone();
        self.service.set_adapter_property(
            &adapter,
            "Discoverable",
            discoverable.into(),
            Box::new(move |res| {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                match res {
                    Err(e) => error!(
                        "DeviceModel: setting Discoverable={} failed: {}",
                        discoverable, e
                    ),
                    Ok(()) if discoverable => {
                        if !this.is_current(generation) {
                            debug!("DeviceModel: discoverable reply for a stale binding");
                        } else if this.discoverable_request.get() != request {
                            debug!("DeviceModel: discoverable reply superseded by a later request");
                        } else {
                            this.arm_discoverable_timeout();
                        }
                    }
                    Ok(()) => {}
                }
            }),
        );
        Ok(())
    }

    fn arm_discoverable_timeout(&self) {
        let this_weak = self.weak_self.clone();
        self.discoverable_timer
            .arm(self.settings.discoverable_timeout, move || {
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                info!("DeviceModel: discoverable timeout expired");
                if let Err(e) = this.try_set_discoverable(false) {
                    debug!("DeviceModel: cannot revert discoverable: {}", e);
                }
            });
    }

    pub fn set_powered(&self, powered: bool) -> Result<()> {
        let (adapter, _) = self.current_adapter()?;
        self.service.set_adapter_property(
            &adapter,
            "Powered",
            powered.into(),
            Box::new(move |res| {
                if let Err(e) = res {
                    error!("DeviceModel: setting Powered={} failed: {}", powered, e);
                }
            }),
        );
        Ok(())
    }

    /// Re-arm the scan cycle for the current discovering state.
    ///
    /// While discovering, discovery is stopped after the active period;
    /// while idle, it is started again after the idle period.
    fn restart_scan_timer(&self) {
        let Some((active, idle)) = self.settings.scan_cycle else {
            return;
        };
        let (powered, discovering) = {
            let adapter = self.adapter.borrow();
            (adapter.powered, adapter.discovering)
        };
        if self.binding.borrow().is_none() || !powered {
            self.scan_timer.disarm();
            return;
        }

        let delay = if discovering { active } else { idle };
        let this_weak = self.weak_self.clone();
        self.scan_timer.arm(delay, move || {
            if let Some(this) = this_weak.upgrade() {
                debug!("DeviceModel: scan cycle toggling discovery");
                if let Err(e) = this.toggle_discovery() {
                    debug!("DeviceModel: scan cycle: {}", e);
                }
            }
        });
    }

    // Device operations

    /// Remember to connect `address` with `mode` once its create succeeds.
    pub fn add_connect_after_pairing(&self, address: &str, mode: ConnectionMode) {
        debug!("DeviceModel: will connect {} as {} after pairing", address, mode);
        self.connect_after_pairing
            .borrow_mut()
            .insert(address.to_string(), mode);
    }

    /// Drop a connect intent without executing it.
    pub fn discard_connect_intent(&self, address: &str) -> Option<ConnectionMode> {
        self.connect_after_pairing.borrow_mut().remove(address)
    }

    /// Ask the service to create (and pair) a device object for `address`.
    ///
    /// No row is added until the service confirms. A second request for the
    /// same address while one is outstanding is rejected.
    pub fn create_device(&self, address: &str, agent: &Agent) -> Result<()> {
        let (adapter, generation) = self.current_adapter()?;
        if !self.pending_creates.borrow_mut().insert(address.to_string()) {
            warn!("DeviceModel: create for {} already pending", address);
            return Err(Error::AlreadyPending(address.to_string()));
        }

        info!("DeviceModel: creating device {}", address);
        let this_weak = self.weak_self.clone();
        let requested = address.to_string();
        self.service.create_paired_device(
            &adapter,
            address,
            agent.object_path(),
            agent.capability(),
            Box::new(move |res| {
                if let Some(this) = this_weak.upgrade() {
                    this.on_create_finished(generation, requested, res);
                }
            }),
        );
        Ok(())
    }

    fn on_create_finished(
        &self,
        generation: u64,
        address: String,
        res: std::result::Result<String, ServiceError>,
    ) {
        if !self.is_current(generation) {
            debug!("DeviceModel: dropping create reply for {} (stale binding)", address);
            return;
        }

        self.pending_creates.borrow_mut().remove(&address);
        let intent = self.connect_after_pairing.borrow_mut().remove(&address);

        match res {
            Ok(path) => {
                info!("DeviceModel: created {} at {}", address, path);
                self.mutate_registry(|r| r.attach_path(&address, &path));
                if let Some(mode) = intent {
                    self.issue_connect(generation, &address, mode);
                }
            }
            Err(error) => {
                error!("DeviceModel: creating {} failed: {}", address, error);
                if let Some(mode) = intent {
                    debug!("DeviceModel: dropping {} connect intent for {}", mode, address);
                }
                self.callbacks
                    .notify(&ModelEvent::CreateFailed { address, error });
            }
        }
    }

    /// Ask the service to remove the device object at `path`.
    ///
    /// The row stays until the service confirms.
    pub fn remove_device(&self, path: &str) -> Result<()> {
        let (adapter, generation) = self.current_adapter()?;
        if self.registry.borrow().find_row_from_path(path).is_none() {
            return Err(Error::DeviceNotFound(path.to_string()));
        }
        if !self.pending_removals.borrow_mut().insert(path.to_string()) {
            warn!("DeviceModel: removal of {} already pending", path);
            return Err(Error::AlreadyPending(path.to_string()));
        }

        info!("DeviceModel: removing device {}", path);
        let this_weak = self.weak_self.clone();
        let requested = path.to_string();
        self.service.remove_device(
            &adapter,
            path,
            Box::new(move |res| {
                if let Some(this) = this_weak.upgrade() {
                    this.on_remove_finished(generation, requested, res);
                }
            }),
        );
        Ok(())
    }

    fn on_remove_finished(
        &self,
        generation: u64,
        path: String,
        res: std::result::Result<(), ServiceError>,
    ) {
        if !self.is_current(generation) {
            debug!("DeviceModel: dropping remove reply for {} (stale binding)", path);
            return;
        }

        self.pending_removals.borrow_mut().remove(&path);
        match res {
            Ok(()) => self.mutate_registry(|r| r.remove_path(&path)),
            Err(error) => {
                error!("DeviceModel: removing {} failed: {}", path, error);
                self.callbacks.notify(&ModelEvent::RemoveFailed { path, error });
            }
        }
    }

    /// Connect a known device with the given profile.
    pub fn connect_device(&self, address: &str, mode: ConnectionMode) -> Result<()> {
        let (_, generation) = self.current_adapter()?;
        if self.registry.borrow().find_row_from_address(address).is_none() {
            return Err(Error::DeviceNotFound(address.to_string()));
        }
        self.issue_connect(generation, address, mode);
        Ok(())
    }

    fn issue_connect(&self, generation: u64, address: &str, mode: ConnectionMode) {
        info!("DeviceModel: connecting {} as {}", address, mode);
        let this_weak = self.weak_self.clone();
        let requested = address.to_string();
        self.service.connect_device(
            address,
            mode,
            Box::new(move |res| {
                let Err(error) = res else {
                    return;
                };
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                if !this.is_current(generation) {
                    debug!(
                        "DeviceModel: dropping connecting failure for {} (stale binding)",
                        requested
                    );
                    return;
                }
                error!("DeviceModel: connecting {} failed: {}", requested, error);
                this.callbacks.notify(&ModelEvent::ConnectFailed {
                    address: requested,
                    error,
                });
            }),
        );
    }

    pub fn disconnect_device(&self, address: &str) -> Result<()> {
        let (_, generation) = self.current_adapter()?;
        if self.registry.borrow().find_row_from_address(address).is_none() {
            return Err(Error::DeviceNotFound(address.to_string()));
        }

        info!("DeviceModel: disconnecting {}", address);
        let this_weak = self.weak_self.clone();
        let requested = address.to_string();
        self.service.disconnect_device(
            address,
            Box::new(move |res| {
                let Err(error) = res else {
                    return;
                };
                let Some(this) = this_weak.upgrade() else {
                    return;
                };
                if !this.is_current(generation) {
                    debug!(
                        "DeviceModel: dropping disconnecting failure for {} (stale binding)",
                        requested
                    );
                    return;
                }
                error!("DeviceModel: disconnecting {} failed: {}", requested, error);
                this.callbacks.notify(&ModelEvent::DisconnectFailed {
                    address: requested,
                    error,
                });
            }),
        );
        Ok(())
    }
}

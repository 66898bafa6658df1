//! Filtered, sorted projections of the device registry.
//!
//! A [`DeviceFilter`] is a plain predicate + comparator. A [`FilteredView`]
//! attaches one to a [`DeviceModel`] and keeps an ordered list of registry
//! rows that pass it, re-evaluated synchronously inside every registry
//! notification so readers never see stale membership.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::callbacks::{CallbackId, Callbacks};
use crate::device::{Connection, Device, DeviceType};
use crate::model::{DeviceModel, ModelEvent};
use crate::registry::{DeviceRegistry, RowChange};

/// Display order of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Case-insensitive name, then address.
    #[default]
    Name,
    /// Connected first, then connecting, disconnecting, disconnected;
    /// ties by name, then address.
    Connection,
}

/// Composable row predicates. A disabled predicate accepts everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFilter {
    types: Option<HashSet<DeviceType>>,
    connections: Option<HashSet<Connection>>,
    trusted: Option<bool>,
    sort: SortOrder,
}

impl DeviceFilter {
    pub fn new(sort: SortOrder) -> Self {
        Self {
            sort,
            ..Default::default()
        }
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort
    }

    /// Only accept devices of the given types.
    pub fn set_type_filter(&mut self, types: impl IntoIterator<Item = DeviceType>) {
        self.types = Some(types.into_iter().collect());
    }

    pub fn clear_type_filter(&mut self) {
        self.types = None;
    }

    /// Only accept devices in one of the given connection states.
    pub fn set_connection_filter(&mut self, states: impl IntoIterator<Item = Connection>) {
        self.connections = Some(states.into_iter().collect());
    }

    pub fn clear_connection_filter(&mut self) {
        self.connections = None;
    }

    /// When `enabled`, only accept devices whose trusted flag equals `trusted`.
    pub fn set_trusted_filter(&mut self, enabled: bool, trusted: bool) {
        self.trusted = enabled.then_some(trusted);
    }

    pub fn with_connections(mut self, states: impl IntoIterator<Item = Connection>) -> Self {
        self.set_connection_filter(states);
        self
    }

    pub fn accepts(&self, device: &Device) -> bool {
        let type_ok = self
            .types
            .as_ref()
            .is_none_or(|types| types.contains(&device.device_type));
        let connection_ok = self
            .connections
            .as_ref()
            .is_none_or(|states| states.contains(&device.connection));
        let trusted_ok = self.trusted.is_none_or(|trusted| device.trusted == trusted);

        type_ok && connection_ok && trusted_ok
    }

    pub fn compare(&self, a: &Device, b: &Device) -> Ordering {
        let by_name = || {
            a.display_name()
                .to_lowercase()
                .cmp(&b.display_name().to_lowercase())
                .then_with(|| a.address.cmp(&b.address))
        };

        match self.sort {
            SortOrder::Name => by_name(),
            SortOrder::Connection => a
                .connection
                .rank()
                .cmp(&b.connection.rank())
                .then_with(by_name),
        }
    }

    pub fn less_than(&self, a: &Device, b: &Device) -> bool {
        self.compare(a, b) == Ordering::Less
    }

    /// Registry rows that pass the filter, in display order.
    pub fn project(&self, registry: &DeviceRegistry) -> Vec<usize> {
        let devices = registry.devices();
        let mut rows: Vec<usize> = (0..devices.len())
            .filter(|&row| self.accepts(&devices[row]))
            .collect();
        rows.sort_by(|&a, &b| self.compare(&devices[a], &devices[b]));
        rows
    }
}

/// Row-level change of a view, in view coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    Inserted(usize),
    Removed(usize),
    Changed(usize),
    /// Membership or order changed in a way not described by one row.
    Reset,
}

struct Member {
    source_row: usize,
    address: String,
}

/// A live projection of a model's registry.
pub struct FilteredView {
    name: &'static str,
    model: Weak<DeviceModel>,
    filter: RefCell<DeviceFilter>,
    members: RefCell<Vec<Member>>,
    subscription: Cell<Option<CallbackId>>,
    callbacks: Callbacks<ViewEvent>,
}

impl FilteredView {
    /// Create a view over `model` and keep it in sync with the registry.
    pub fn attach(name: &'static str, model: &Rc<DeviceModel>, filter: DeviceFilter) -> Rc<Self> {
        let view = Rc::new(Self {
            name,
            model: Rc::downgrade(model),
            filter: RefCell::new(filter),
            members: RefCell::new(Vec::new()),
            subscription: Cell::new(None),
            callbacks: Callbacks::new(),
        });

        let view_weak = Rc::downgrade(&view);
        let id = model.connect(move |event| {
            if let (Some(view), ModelEvent::Row(change)) = (view_weak.upgrade(), event) {
                view.sync(Some(change));
            }
        });
        view.subscription.set(Some(id));
        view.sync(None);
        view
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn connect<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ViewEvent) + 'static,
    {
        self.callbacks.register(callback)
    }

    pub fn disconnect(&self, id: CallbackId) -> bool {
        self.callbacks.unregister(id)
    }

    pub fn filter(&self) -> DeviceFilter {
        self.filter.borrow().clone()
    }

    pub fn set_type_filter(&self, types: impl IntoIterator<Item = DeviceType>) {
        self.filter.borrow_mut().set_type_filter(types);
        self.sync(None);
    }

    pub fn clear_type_filter(&self) {
        self.filter.borrow_mut().clear_type_filter();
        self.sync(None);
    }

    pub fn set_connection_filter(&self, states: impl IntoIterator<Item = Connection>) {
        self.filter.borrow_mut().set_connection_filter(states);
        self.sync(None);
    }

    pub fn clear_connection_filter(&self) {
        self.filter.borrow_mut().clear_connection_filter();
        self.sync(None);
    }

    pub fn set_trusted_filter(&self, enabled: bool, trusted: bool) {
        self.filter.borrow_mut().set_trusted_filter(enabled, trusted);
        self.sync(None);
    }

    /// Whether the registry row `row` passes this view's predicates.
    pub fn filter_accepts_row(&self, row: usize) -> bool {
        let Some(model) = self.model.upgrade() else {
            return false;
        };
        let filter = self.filter.borrow();
        model.with_registry(|r| r.get(row).is_some_and(|d| filter.accepts(d)))
    }

    /// Whether registry row `a` sorts before registry row `b`.
    pub fn less_than(&self, a: usize, b: usize) -> bool {
        let Some(model) = self.model.upgrade() else {
            return false;
        };
        let filter = self.filter.borrow();
        model.with_registry(|r| match (r.get(a), r.get(b)) {
            (Some(a), Some(b)) => filter.less_than(a, b),
            _ => false,
        })
    }

    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.borrow().is_empty()
    }

    /// Registry row shown at `view_row`.
    pub fn source_row(&self, view_row: usize) -> Option<usize> {
        self.members.borrow().get(view_row).map(|m| m.source_row)
    }

    pub fn device_at(&self, view_row: usize) -> Option<Device> {
        let row = self.source_row(view_row)?;
        self.model.upgrade()?.device_at(row)
    }

    pub fn devices(&self) -> Vec<Device> {
        let Some(model) = self.model.upgrade() else {
            return Vec::new();
        };
        let members = self.members.borrow();
        model.with_registry(|r| {
            members
                .iter()
                .filter_map(|m| r.get(m.source_row).cloned())
                .collect()
        })
    }

    /// Addresses in display order.
    pub fn addresses(&self) -> Vec<String> {
        self.members
            .borrow()
            .iter()
            .map(|m| m.address.clone())
            .collect()
    }

    /// Recompute membership and publish what changed.
    fn sync(&self, change: Option<&RowChange>) {
        let Some(model) = self.model.upgrade() else {
            return;
        };

        let fresh: Vec<Member> = {
            let filter = self.filter.borrow();
            model.with_registry(|r| {
                filter
                    .project(r)
                    .into_iter()
                    .map(|row| Member {
                        source_row: row,
                        address: r.devices()[row].address.clone(),
                    })
                    .collect()
            })
        };

        let event = {
            let old = self.members.borrow();
            diff(&old, &fresh, change)
        };
        *self.members.borrow_mut() = fresh;

        if let Some(event) = event {
            trace!("FilteredView {}: {:?}", self.name, event);
            self.callbacks.notify(&event);
        }
    }
}

impl Drop for FilteredView {
    fn drop(&mut self) {
        if let (Some(model), Some(id)) = (self.model.upgrade(), self.subscription.take()) {
            model.disconnect(id);
        }
    }
}

/// Describe the transition from `old` to `new` as a single view event.
fn diff(old: &[Member], new: &[Member], change: Option<&RowChange>) -> Option<ViewEvent> {
    let same_order = old.len() == new.len()
        && old.iter().zip(new).all(|(a, b)| a.address == b.address);

    if same_order {
        // A property change that kept the row in place.
        if let Some(RowChange::Changed(row)) = change {
            return new
                .iter()
                .position(|m| m.source_row == *row)
                .map(ViewEvent::Changed);
        }
        return None;
    }

    if new.len() + 1 == old.len() {
        let at = first_mismatch(old, new);
        if old[at + 1..]
            .iter()
            .zip(&new[at..])
            .all(|(a, b)| a.address == b.address)
        {
            return Some(ViewEvent::Removed(at));
        }
    }

    if new.len() == old.len() + 1 {
        let at = first_mismatch(new, old);
        if new[at + 1..]
            .iter()
            .zip(&old[at..])
            .all(|(a, b)| a.address == b.address)
        {
            return Some(ViewEvent::Inserted(at));
        }
    }

    Some(ViewEvent::Reset)
}

/// Index of the first position where `longer` and `shorter` differ.
fn first_mismatch(longer: &[Member], shorter: &[Member]) -> usize {
    shorter
        .iter()
        .zip(longer)
        .position(|(a, b)| a.address != b.address)
        .unwrap_or(shorter.len())
}

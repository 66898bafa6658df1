//! Filtered views stay equal to "rows matching the enabled predicates",
//! in display order, across random registry mutations and filter changes.

mod common;

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use bluepanel_core::{
    Connection, Device, DeviceFilter, DeviceType, FilteredView, ServiceEvent, SortOrder,
    ViewEvent,
};
use common::{Harness, device_path};
use proptest::prelude::*;

const ADDRESSES: [&str; 6] = [
    "00:00:00:00:00:01",
    "00:00:00:00:00:02",
    "00:00:00:00:00:03",
    "00:00:00:00:00:04",
    "00:00:00:00:00:05",
    "00:00:00:00:00:06",
];
const NAMES: [&str; 4] = ["alpha", "Beta", "beta", ""];
const TYPES: [DeviceType; 4] = [
    DeviceType::Headset,
    DeviceType::Keyboard,
    DeviceType::Phone,
    DeviceType::Unknown,
];
const STATES: [&str; 4] = ["disconnected", "connecting", "connected", "disconnecting"];

#[derive(Clone, Debug)]
enum Operation {
    Found { device: u8, name: u8, kind: u8 },
    Disappeared { device: u8 },
    Created { device: u8, trusted: bool },
    Removed { device: u8 },
    State { device: u8, state: u8 },
    Trusted { device: u8, trusted: bool },
    Rename { device: u8, name: u8 },
    TypeFilter { mask: Option<u8> },
    ConnectionFilter { mask: Option<u8> },
    TrustedFilter { trusted: Option<bool> },
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        (any::<u8>(), any::<u8>(), any::<u8>())
            .prop_map(|(device, name, kind)| Operation::Found { device, name, kind }),
        any::<u8>().prop_map(|device| Operation::Disappeared { device }),
        (any::<u8>(), any::<bool>())
            .prop_map(|(device, trusted)| Operation::Created { device, trusted }),
        any::<u8>().prop_map(|device| Operation::Removed { device }),
        (any::<u8>(), any::<u8>()).prop_map(|(device, state)| Operation::State { device, state }),
        (any::<u8>(), any::<bool>())
            .prop_map(|(device, trusted)| Operation::Trusted { device, trusted }),
        (any::<u8>(), any::<u8>()).prop_map(|(device, name)| Operation::Rename { device, name }),
        proptest::option::of(any::<u8>()).prop_map(|mask| Operation::TypeFilter { mask }),
        proptest::option::of(any::<u8>()).prop_map(|mask| Operation::ConnectionFilter { mask }),
        proptest::option::of(any::<bool>()).prop_map(|trusted| Operation::TrustedFilter { trusted }),
    ]
}

fn address(hint: u8) -> &'static str {
    ADDRESSES[hint as usize % ADDRESSES.len()]
}

fn pick<T: Copy>(values: &[T], mask: u8) -> Vec<T> {
    values
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, v)| *v)
        .collect()
}

/// Predicate state tracked independently of the view.
#[derive(Default)]
struct Oracle {
    types: Option<HashSet<DeviceType>>,
    connections: Option<HashSet<Connection>>,
    trusted: Option<bool>,
}

impl Oracle {
    fn accepts(&self, d: &Device) -> bool {
        self.types.as_ref().is_none_or(|t| t.contains(&d.device_type))
            && self
                .connections
                .as_ref()
                .is_none_or(|c| c.contains(&d.connection))
            && self.trusted.is_none_or(|t| d.trusted == t)
    }
}

fn sort_key(order: SortOrder, d: &Device) -> (u8, String, String) {
    let rank = match (order, d.connection) {
        (SortOrder::Name, _) => 0,
        (SortOrder::Connection, Connection::Connected) => 0,
        (SortOrder::Connection, Connection::Connecting) => 1,
        (SortOrder::Connection, Connection::Disconnecting) => 2,
        (SortOrder::Connection, Connection::Disconnected) => 3,
    };
    let name = if d.name.is_empty() { &d.address } else { &d.name };
    (rank, name.to_lowercase(), d.address.clone())
}

/// Replays view notifications onto a plain list of addresses.
fn mirror(view: &Rc<FilteredView>) -> Rc<RefCell<Vec<String>>> {
    let rows = Rc::new(RefCell::new(view.addresses()));
    let sink = rows.clone();
    let view_weak: Weak<FilteredView> = Rc::downgrade(view);
    view.connect(move |event| {
        let Some(view) = view_weak.upgrade() else {
            return;
        };
        let mut rows = sink.borrow_mut();
        match *event {
            ViewEvent::Inserted(i) => rows.insert(i, view.addresses()[i].clone()),
            ViewEvent::Removed(i) => {
                rows.remove(i);
            }
            ViewEvent::Changed(_) => {}
            ViewEvent::Reset => *rows = view.addresses(),
        }
    });
    rows
}

fn apply(h: &Harness, view: &FilteredView, oracle: &mut Oracle, op: Operation) {
    match op {
        Operation::Found { device, name, kind } => h.found(
            address(device),
            &[
                ("Name", NAMES[name as usize % NAMES.len()].into()),
                ("Type", TYPES[kind as usize % TYPES.len()].as_str().into()),
            ],
        ),
        Operation::Disappeared { device } => h.ingest(ServiceEvent::DeviceDisappeared {
            address: address(device).to_string(),
        }),
        Operation::Created { device, trusted } => {
            h.created(address(device), &[("Trusted", trusted.into())])
        }
        Operation::Removed { device } => h.ingest(ServiceEvent::DeviceRemoved {
            path: device_path(address(device)),
        }),
        Operation::State { device, state } => h.property_changed(
            address(device),
            "State",
            STATES[state as usize % STATES.len()].into(),
        ),
        Operation::Trusted { device, trusted } => {
            h.property_changed(address(device), "Trusted", trusted.into())
        }
        Operation::Rename { device, name } => h.property_changed(
            address(device),
            "Alias",
            NAMES[name as usize % NAMES.len()].into(),
        ),
        Operation::TypeFilter { mask } => match mask {
            Some(mask) => {
                let types = pick(&TYPES, mask);
                oracle.types = Some(types.iter().copied().collect());
                view.set_type_filter(types);
            }
            None => {
                oracle.types = None;
                view.clear_type_filter();
            }
        },
        Operation::ConnectionFilter { mask } => match mask {
            Some(mask) => {
                let states = pick(&Connection::ALL, mask);
                oracle.connections = Some(states.iter().copied().collect());
                view.set_connection_filter(states);
            }
            None => {
                oracle.connections = None;
                view.clear_connection_filter();
            }
        },
        Operation::TrustedFilter { trusted } => {
            oracle.trusted = trusted;
            view.set_trusted_filter(trusted.is_some(), trusted.unwrap_or(false));
        }
    }
}

fn check(h: &Harness, view: &FilteredView, oracle: &Oracle, order: SortOrder) {
    let devices = h.model().devices();
    let expected: HashSet<String> = devices
        .iter()
        .filter(|d| oracle.accepts(d))
        .map(|d| d.address.clone())
        .collect();

    let shown = view.devices();
    let shown_set: HashSet<String> = shown.iter().map(|d| d.address.clone()).collect();
    assert_eq!(shown.len(), shown_set.len(), "a row is shown twice");
    assert_eq!(shown_set, expected);

    for pair in shown.windows(2) {
        assert!(
            sort_key(order, &pair[0]) < sort_key(order, &pair[1]),
            "{:?} shown before {:?}",
            pair[0],
            pair[1]
        );
    }

    for row in 0..h.model().row_count() {
        let device = h.model().device_at(row).unwrap();
        assert_eq!(view.filter_accepts_row(row), oracle.accepts(&device));
    }
}

proptest! {
    #[test]
    fn view_membership_matches_predicates(
        ops in prop::collection::vec(operation_strategy(), 1..80),
        by_connection in any::<bool>(),
    ) {
        let h = Harness::new();
        h.bind_powered();

        let order = if by_connection { SortOrder::Connection } else { SortOrder::Name };
        let view = FilteredView::attach("under-test", h.model(), DeviceFilter::new(order));
        let rows = mirror(&view);
        let mut oracle = Oracle::default();

        for op in ops {
            apply(&h, &view, &mut oracle, op);
            check(&h, &view, &oracle, order);
            prop_assert_eq!(rows.borrow().clone(), view.addresses());
        }
    }

    #[test]
    fn panel_views_partition_the_registry(
        ops in prop::collection::vec(operation_strategy(), 1..60),
    ) {
        let h = Harness::new();
        h.bind_powered();

        for op in ops {
            // Filter changes target a throwaway view; the panel's own views
            // keep their fixed predicates.
            let scratch = FilteredView::attach("scratch", h.model(), DeviceFilter::default());
            apply(&h, &scratch, &mut Oracle::default(), op);

            let connected = h.panel.connected_devices().addresses();
            let disconnected = h.panel.disconnected_devices().addresses();
            let mut all: Vec<String> = connected.iter().chain(&disconnected).cloned().collect();
            all.sort();
            let mut registry: Vec<String> =
                h.model().devices().into_iter().map(|d| d.address).collect();
            registry.sort();
            prop_assert_eq!(all, registry);
        }
    }
}

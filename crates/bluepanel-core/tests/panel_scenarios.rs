//! End-to-end panel behaviour: device lists, selection, connect and
//! pairing prompts.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bluepanel_core::{
    AgentEvent, Connection, EndReason, Error, PanelEvent, PromptKind, ReplyValue, ServiceError,
    ServiceEvent, ViewEvent,
};
use bluepanel_core::service::ERROR_CANCELED;
use common::{HEADSET, Harness, KEYBOARD, device_path, record};

const PHONE: &str = "99:88:77:66:55:44";

#[test]
fn test_bind_publishes_adapter_state() {
    let h = Harness::new();
    let (events, listener) = record::<PanelEvent>();
    h.panel.connect(listener);

    h.bind_powered();

    assert_eq!(h.panel.adapter_name(), "hci0");
    assert!(h.panel.is_powered());
    assert!(!h.panel.is_discovering());
    assert!(!h.panel.is_discoverable());
    let events = events.borrow();
    assert!(events.contains(&PanelEvent::AdapterNameChanged("hci0".to_string())));
    assert!(events.contains(&PanelEvent::PoweredChanged(true)));
}

#[test]
fn test_devices_split_by_connection() {
    let h = Harness::new();
    h.bind_powered();

    h.found(KEYBOARD, &[("Name", "zeta keyboard".into())]);
    h.found(PHONE, &[("Name", "Alpha phone".into())]);
    h.created(HEADSET, &[("Name", "Headset".into()), ("Connected", true.into())]);

    let connected = h.panel.connected_devices();
    let disconnected = h.panel.disconnected_devices();
    assert_eq!(connected.addresses(), vec![HEADSET.to_string()]);
    assert_eq!(
        disconnected.addresses(),
        vec![PHONE.to_string(), KEYBOARD.to_string()]
    );

    h.created(KEYBOARD, &[]);
    let (connected_events, listener) = record::<ViewEvent>();
    connected.connect(listener);
    let (disconnected_events, listener) = record::<ViewEvent>();
    disconnected.connect(listener);

    h.property_changed(KEYBOARD, "State", "connecting".into());

    assert_eq!(
        connected.addresses(),
        vec![HEADSET.to_string(), KEYBOARD.to_string()]
    );
    assert_eq!(disconnected.addresses(), vec![PHONE.to_string()]);
    assert_eq!(*connected_events.borrow(), vec![ViewEvent::Inserted(1)]);
    assert_eq!(*disconnected_events.borrow(), vec![ViewEvent::Removed(1)]);

    h.property_changed(KEYBOARD, "State", "connected".into());
    h.property_changed(HEADSET, "Connected", false.into());
    assert_eq!(connected.addresses(), vec![KEYBOARD.to_string()]);
    assert_eq!(connected.device_at(0).unwrap().connection, Connection::Connected);
}

#[test]
fn test_selection_follows_the_registry() {
    let h = Harness::new();
    h.bind_powered();
    h.found(KEYBOARD, &[("Name", "Keyboard".into())]);
    let (events, listener) = record::<PanelEvent>();
    h.panel.connect(listener);

    h.panel.set_selected_device(Some(KEYBOARD));
    h.panel.set_selected_device(Some(KEYBOARD));
    assert_eq!(h.panel.selected_device().unwrap().name, "Keyboard");

    h.found(KEYBOARD, &[("Name", "Keyboard 2".into())]);
    // Changes to other rows don't count.
    h.found(HEADSET, &[("Name", "Headset".into())]);

    h.ingest(ServiceEvent::DeviceDisappeared {
        address: KEYBOARD.to_string(),
    });
    assert!(h.panel.selected_device().is_none());
    assert_eq!(h.panel.selected_address().as_deref(), Some(KEYBOARD));

    h.found(KEYBOARD, &[("Name", "Back again".into())]);
    assert_eq!(h.panel.selected_device().unwrap().name, "Back again");

    let names: Vec<Option<String>> = events
        .borrow()
        .iter()
        .map(|e| match e {
            PanelEvent::SelectedDeviceChanged(d) => d.as_ref().map(|d| d.name.clone()),
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(
        names,
        vec![
            Some("Keyboard".to_string()),
            Some("Keyboard 2".to_string()),
            None,
            Some("Back again".to_string()),
        ]
    );

    h.panel.set_selected_device(None);
    assert!(h.panel.selected_device().is_none());
}

#[test]
fn test_connect_unpaired_device_pairs_first() {
    let h = Harness::new();
    h.bind_powered();
    h.found(HEADSET, &[("Name", "Headset".into()), ("Type", "headset".into())]);

    h.panel.connect_device(HEADSET).unwrap();
    assert_eq!(
        h.model().connect_intent(HEADSET),
        Some(bluepanel_core::ConnectionMode::Headset)
    );
    assert!(h.service.calls_to("connect_device").is_empty());

    // Asking again while pairing keeps the queued connect.
    assert!(matches!(
        h.panel.connect_device(HEADSET),
        Err(Error::AlreadyPending(_))
    ));
    assert!(h.model().connect_intent(HEADSET).is_some());

    h.service
        .complete(
            "create_paired_device",
            Ok(ReplyValue::Path(device_path(HEADSET))),
        )
        .unwrap();
    assert_eq!(h.service.calls_to("connect_device").len(), 1);
    assert_eq!(h.model().connect_intent(HEADSET), None);
}

#[test]
fn test_connect_paired_device_directly() {
    let h = Harness::new();
    h.bind_powered();
    h.created(
        KEYBOARD,
        &[("Paired", true.into()), ("Class", 0x002540i64.into())],
    );

    h.panel.connect_device(KEYBOARD).unwrap();

    assert!(h.service.calls_to("create_paired_device").is_empty());
    let connects = h.service.calls_to("connect_device");
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].args[1], "input");
}

#[test]
fn test_connect_without_profile() {
    let h = Harness::new();
    h.bind_powered();
    h.created(PHONE, &[("Paired", true.into()), ("Type", "printer".into())]);
    h.found(KEYBOARD, &[("Type", "computer".into())]);

    assert!(matches!(
        h.panel.connect_device(PHONE),
        Err(Error::NoConnectionMode(_))
    ));
    assert!(matches!(
        h.panel.connect_device(HEADSET),
        Err(Error::DeviceNotFound(_))
    ));

    // Pairing still happens, just without a queued connect.
    h.panel.connect_device(KEYBOARD).unwrap();
    assert_eq!(h.service.calls_to("create_paired_device").len(), 1);
    assert_eq!(h.model().connect_intent(KEYBOARD), None);
}

#[test]
fn test_disconnect_and_remove_selected() {
    let h = Harness::new();
    h.bind_powered();
    h.created(HEADSET, &[("Connected", true.into())]);

    assert!(matches!(h.panel.disconnect_device(), Err(Error::NoSelection)));
    assert!(matches!(h.panel.remove_device(), Err(Error::NoSelection)));

    h.panel.set_selected_device(Some(HEADSET));
    h.panel.disconnect_device().unwrap();
    assert_eq!(
        h.service.calls_to("disconnect_device")[0].args,
        vec![HEADSET.to_string()]
    );

    h.panel.remove_device().unwrap();
    h.service.complete_ok("remove_device").unwrap();
    assert!(h.panel.selected_device().is_none());
    assert!(h.panel.connected_devices().is_empty());
}

#[test]
fn test_pairing_prompt_during_create() {
    let h = Harness::new();
    h.bind_powered();
    h.found(PHONE, &[("Name", "Phone".into()), ("Type", "phone".into())]);
    h.panel.set_selected_device(Some(PHONE));
    let (panel_events, listener) = record::<PanelEvent>();
    h.panel.connect(listener);
    let (agent_events, listener) = record::<AgentEvent>();
    h.panel.agent().connect(listener);

    h.panel.connect_device(PHONE).unwrap();

    // BlueZ creates the object, then asks the agent to confirm.
    h.created(PHONE, &[]);
    let answer = Rc::new(RefCell::new(None));
    let sink = answer.clone();
    h.panel.agent().request_confirmation(
        &device_path(PHONE),
        246810,
        Box::new(move |accepted| *sink.borrow_mut() = Some(accepted)),
    );

    let prompt = h.panel.agent().pending_prompt().unwrap();
    assert_eq!(prompt.kind, PromptKind::Confirmation { passkey: 246810 });
    assert_eq!(prompt.device.unwrap().name, "Phone");

    panel_events.borrow_mut().clear();
    h.panel.agent().confirm(true).unwrap();
    assert_eq!(*answer.borrow(), Some(true));
    assert_eq!(
        agent_events.borrow().last(),
        Some(&AgentEvent::PromptEnded(EndReason::Answered))
    );
    assert!(matches!(
        panel_events.borrow().last(),
        Some(PanelEvent::SelectedDeviceChanged(Some(d))) if d.address == PHONE
    ));

    h.service
        .complete(
            "create_paired_device",
            Ok(ReplyValue::Path(device_path(PHONE))),
        )
        .unwrap();
    let connects = h.service.calls_to("connect_device");
    assert_eq!(
        connects[0].args,
        vec![PHONE.to_string(), "handsfree-gateway".to_string()]
    );
}

#[test]
fn test_pin_timeout_then_new_request() {
    let h = Harness::new();
    h.bind_powered();
    h.found(KEYBOARD, &[("Type", "keyboard".into())]);
    h.panel.connect_device(KEYBOARD).unwrap();
    h.created(KEYBOARD, &[]);

    let answers = Rc::new(RefCell::new(Vec::new()));
    let sink = answers.clone();
    h.panel.agent().request_pin_code(
        &device_path(KEYBOARD),
        Box::new(move |pin| sink.borrow_mut().push(pin)),
    );

    h.scheduler.advance(Duration::from_secs(20));
    assert_eq!(*answers.borrow(), vec![String::new()]);
    assert!(h.panel.agent().is_idle());

    // The service turns the empty PIN into a failed create.
    h.service
        .complete(
            "create_paired_device",
            Err(ServiceError::new(ERROR_CANCELED, "")),
        )
        .unwrap();
    assert_eq!(h.model().connect_intent(KEYBOARD), None);
    assert!(h.service.calls_to("connect_device").is_empty());

    // A fresh attempt gets a fresh prompt.
    h.panel.connect_device(KEYBOARD).unwrap();
    let sink = answers.clone();
    h.panel.agent().request_pin_code(
        &device_path(KEYBOARD),
        Box::new(move |pin| sink.borrow_mut().push(pin)),
    );
    h.panel.agent().provide_pin_code("1234").unwrap();
    assert_eq!(
        *answers.borrow(),
        vec![String::new(), "1234".to_string()]
    );
}

#[test]
fn test_service_loss_clears_everything() {
    let h = Harness::new();
    h.bind_powered();
    h.created(HEADSET, &[("Connected", true.into())]);
    h.found(KEYBOARD, &[]);
    h.panel.set_selected_device(Some(HEADSET));
    let (events, listener) = record::<PanelEvent>();
    h.panel.connect(listener);

    h.ingest(ServiceEvent::ServiceLost);

    assert!(h.panel.connected_devices().is_empty());
    assert!(h.panel.disconnected_devices().is_empty());
    assert!(h.panel.selected_device().is_none());
    assert!(!h.panel.is_powered());
    let events = events.borrow();
    assert!(events.contains(&PanelEvent::PoweredChanged(false)));
    assert_eq!(events.last(), Some(&PanelEvent::SelectedDeviceChanged(None)));
}

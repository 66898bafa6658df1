//! An in-process [`BluezService`] whose calls are answered by hand.
//!
//! Every outbound call is queued with its completion. A driver (a replay
//! script or a test) inspects the queue and resolves calls in whatever
//! order it likes, which makes late, stale and failed completions easy to
//! reproduce.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::device::ConnectionMode;
use crate::service::{
    BluezService, DeviceObject, PropertyMap, PropertyValue, Reply, ServiceError,
};

/// A recorded outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Call {
    pub id: u64,
    /// Trait method name, e.g. `create_paired_device`.
    pub method: &'static str,
    /// Stringified arguments in declaration order.
    pub args: Vec<String>,
}

/// Success payload used to resolve a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyValue {
    Unit,
    Path(String),
    Properties(PropertyMap),
    Devices(Vec<DeviceObject>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptedError {
    #[error("no pending {0} call")]
    NoPendingCall(String),

    #[error("{method} expects {expected} as its reply")]
    WrongReply {
        method: &'static str,
        expected: &'static str,
    },
}

enum Completion {
    Properties(Reply<PropertyMap>),
    Devices(Reply<Vec<DeviceObject>>),
    Unit(Reply<()>),
    Path(Reply<String>),
}

impl Completion {
    fn expected(&self) -> &'static str {
        match self {
            Completion::Properties(_) => "a property map",
            Completion::Devices(_) => "a device list",
            Completion::Unit(_) => "null",
            Completion::Path(_) => "an object path",
        }
    }

    fn fail(self, error: ServiceError) {
        match self {
            Completion::Properties(reply) => reply(Err(error)),
            Completion::Devices(reply) => reply(Err(error)),
            Completion::Unit(reply) => reply(Err(error)),
            Completion::Path(reply) => reply(Err(error)),
        }
    }
}

struct PendingCall {
    call: Call,
    completion: Completion,
}

#[derive(Default)]
pub struct ScriptedService {
    next_id: Cell<u64>,
    pending: RefCell<VecDeque<PendingCall>>,
    history: RefCell<Vec<Call>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls still waiting for an answer, oldest first.
    pub fn pending(&self) -> Vec<Call> {
        self.pending.borrow().iter().map(|p| p.call.clone()).collect()
    }

    /// Every call ever made, oldest first.
    pub fn history(&self) -> Vec<Call> {
        self.history.borrow().clone()
    }

    /// Calls to `method` made so far.
    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.history
            .borrow()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Resolve the oldest pending call to `method`.
    ///
    /// The completion runs after the queue is released, so it may issue
    /// new calls. A payload of the wrong shape leaves the call queued.
    pub fn complete(
        &self,
        method: &str,
        result: Result<ReplyValue, ServiceError>,
    ) -> Result<Call, ScriptedError> {
        let (index, PendingCall { call, completion }) = {
            let mut queue = self.pending.borrow_mut();
            let index = queue
                .iter()
                .position(|p| p.call.method == method)
                .ok_or_else(|| ScriptedError::NoPendingCall(method.to_string()))?;
            let pending = queue
                .remove(index)
                .ok_or_else(|| ScriptedError::NoPendingCall(method.to_string()))?;
            (index, pending)
        };

        trace!("ScriptedService: completing {} #{}", call.method, call.id);
        let outcome = match (completion, result) {
            (completion, Err(e)) => {
                completion.fail(e);
                Ok(())
            }
            (Completion::Properties(reply), Ok(ReplyValue::Properties(p))) => {
                reply(Ok(p));
                Ok(())
            }
            (Completion::Devices(reply), Ok(ReplyValue::Devices(d))) => {
                reply(Ok(d));
                Ok(())
            }
            // An empty JSON object or null reads as "no devices".
            (Completion::Devices(reply), Ok(ReplyValue::Unit)) => {
                reply(Ok(Vec::new()));
                Ok(())
            }
            (Completion::Devices(reply), Ok(ReplyValue::Properties(p))) if p.is_empty() => {
                reply(Ok(Vec::new()));
                Ok(())
            }
            (Completion::Unit(reply), Ok(ReplyValue::Unit)) => {
                reply(Ok(()));
                Ok(())
            }
            (Completion::Path(reply), Ok(ReplyValue::Path(path))) => {
                reply(Ok(path));
                Ok(())
            }
            (completion, Ok(_)) => Err(completion),
        };

        match outcome {
            Ok(()) => Ok(call),
            Err(completion) => {
                let error = ScriptedError::WrongReply {
                    method: call.method,
                    expected: completion.expected(),
                };
                self.pending
                    .borrow_mut()
                    .insert(index, PendingCall { call, completion });
                Err(error)
            }
        }
    }

    /// Resolve the oldest pending `method` call successfully with no payload.
    pub fn complete_ok(&self, method: &str) -> Result<Call, ScriptedError> {
        self.complete(method, Ok(ReplyValue::Unit))
    }

    fn push(&self, method: &'static str, args: Vec<String>, completion: Completion) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let call = Call { id, method, args };
        trace!("ScriptedService: {} {:?}", method, call.args);
        self.history.borrow_mut().push(call.clone());
        self.pending
            .borrow_mut()
            .push_back(PendingCall { call, completion });
    }
}

impl BluezService for ScriptedService {
    fn adapter_properties(&self, adapter: &str, reply: Reply<PropertyMap>) {
        self.push(
            "adapter_properties",
            vec![adapter.to_string()],
            Completion::Properties(reply),
        );
    }

    fn list_devices(&self, adapter: &str, reply: Reply<Vec<DeviceObject>>) {
        self.push(
            "list_devices",
            vec![adapter.to_string()],
            Completion::Devices(reply),
        );
    }

    fn start_discovery(&self, adapter: &str, reply: Reply<()>) {
        self.push(
            "start_discovery",
            vec![adapter.to_string()],
            Completion::Unit(reply),
        );
    }

    fn stop_discovery(&self, adapter: &str, reply: Reply<()>) {
        self.push(
            "stop_discovery",
            vec![adapter.to_string()],
            Completion::Unit(reply),
        );
    }

    fn set_adapter_property(
        &self,
        adapter: &str,
        key: &str,
        value: PropertyValue,
        reply: Reply<()>,
    ) {
        self.push(
            "set_adapter_property",
            vec![adapter.to_string(), key.to_string(), value.to_string()],
            Completion::Unit(reply),
        );
    }

    fn create_paired_device(
        &self,
        adapter: &str,
        address: &str,
        agent_path: &str,
        capability: &str,
        reply: Reply<String>,
    ) {
        self.push(
            "create_paired_device",
            vec![
                adapter.to_string(),
                address.to_string(),
                agent_path.to_string(),
                capability.to_string(),
            ],
            Completion::Path(reply),
        );
    }

    fn remove_device(&self, adapter: &str, path: &str, reply: Reply<()>) {
        self.push(
            "remove_device",
            vec![adapter.to_string(), path.to_string()],
            Completion::Unit(reply),
        );
    }

    fn connect_device(&self, address: &str, mode: ConnectionMode, reply: Reply<()>) {
        self.push(
            "connect_device",
            vec![address.to_string(), mode.to_string()],
            Completion::Unit(reply),
        );
    }

    fn disconnect_device(&self, address: &str, reply: Reply<()>) {
        self.push(
            "disconnect_device",
            vec![address.to_string()],
            Completion::Unit(reply),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_calls_are_recorded_and_completed_in_order() {
        let service = ScriptedService::new();
        let results = Rc::new(RefCell::new(Vec::new()));

        for address in ["AA", "BB"] {
            let results = results.clone();
            service.disconnect_device(
                address,
                Box::new(move |res| results.borrow_mut().push(res.is_ok())),
            );
        }
        assert_eq!(service.pending().len(), 2);

        let call = service.complete_ok("disconnect_device").unwrap();
        assert_eq!(call.args, vec!["AA".to_string()]);

        let call = service
            .complete(
                "disconnect_device",
                Err(ServiceError::new("org.bluez.Error.NotConnected", "")),
            )
            .unwrap();
        assert_eq!(call.args, vec!["BB".to_string()]);

        assert_eq!(*results.borrow(), vec![true, false]);
        assert!(service.pending().is_empty());
        assert_eq!(service.calls_to("disconnect_device").len(), 2);
    }

    #[test]
    fn test_wrong_reply_shape_keeps_call_queued() {
        let service = ScriptedService::new();
        service.create_paired_device(
            "/org/bluez/hci0",
            "AA",
            "/agent",
            "DisplayYesNo",
            Box::new(|_| {}),
        );

        let err = service.complete_ok("create_paired_device").unwrap_err();
        assert!(matches!(err, ScriptedError::WrongReply { .. }));
        assert_eq!(service.pending().len(), 1);

        service
            .complete("create_paired_device", Ok(ReplyValue::Path("/dev".to_string())))
            .unwrap();
        assert!(service.pending().is_empty());
    }

    #[test]
    fn test_no_pending_call() {
        let service = ScriptedService::new();
        assert_eq!(
            service.complete_ok("start_discovery"),
            Err(ScriptedError::NoPendingCall("start_discovery".to_string()))
        );
    }

    #[test]
    fn test_reply_value_json() {
        let value: ReplyValue = serde_json::from_str("null").unwrap();
        assert_eq!(value, ReplyValue::Unit);
        let value: ReplyValue = serde_json::from_str(r#""/org/bluez/hci0/dev_1""#).unwrap();
        assert_eq!(value, ReplyValue::Path("/org/bluez/hci0/dev_1".to_string()));
        let value: ReplyValue = serde_json::from_str(r#"{"Powered":true}"#).unwrap();
        assert!(matches!(value, ReplyValue::Properties(ref p) if p.len() == 1));
        let value: ReplyValue =
            serde_json::from_str(r#"[{"path":"/d","properties":{"Address":"AA"}}]"#).unwrap();
        assert!(matches!(value, ReplyValue::Devices(ref d) if d.len() == 1));
    }
}

//! Pairing agent.
//!
//! BlueZ calls into the agent while a create/pair request is in flight to
//! ask for a PIN, a passkey or a confirmation. The agent turns each call
//! into a [`Prompt`] for the presentation layer and answers the service
//! once the user responds, the request is cancelled, or the response
//! window expires.
//!
//! Exactly one request may be outstanding. A second request while one is
//! pending is answered as rejected immediately.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::callbacks::{CallbackId, Callbacks};
use crate::config::Config;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::model::DeviceModel;
use crate::timer::{DelayedTask, Scheduler};

/// Agent identity and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    /// Object path the agent is exported at.
    pub object_path: String,
    /// IO capability announced to the service.
    pub capability: String,
    /// How long a prompt waits for the user before it is cancelled.
    pub response_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            object_path: "/org/bluepanel/agent".to_string(),
            capability: "DisplayYesNo".to_string(),
            response_timeout: Duration::from_secs(20),
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            object_path: config.agent.object_path.clone(),
            capability: config.agent.capability.clone(),
            response_timeout: Duration::from_secs(config.agent.response_timeout_secs),
        }
    }
}

/// What the service is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    PinCode,
    Passkey,
    /// Confirm that the remote shows the same passkey.
    Confirmation { passkey: u32 },
    /// Show a passkey the user types on the remote; `entered` digits so far.
    DisplayPasskey { passkey: u32, entered: u8 },
}

impl PromptKind {
    fn label(self) -> &'static str {
        match self {
            PromptKind::PinCode => "pin code",
            PromptKind::Passkey => "passkey",
            PromptKind::Confirmation { .. } => "confirmation",
            PromptKind::DisplayPasskey { .. } => "passkey display",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A request presented to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub device_path: String,
    /// The device as currently known to the registry, if it is.
    pub device: Option<Device>,
    pub kind: PromptKind,
}

/// Why a prompt went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Answered,
    Cancelled,
    Released,
    TimedOut,
}

/// Notifications published by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    PromptStarted(Prompt),
    /// A passkey display started or progressed.
    PromptUpdated(Prompt),
    PromptEnded(EndReason),
    /// The service released the agent.
    Released,
}

enum Responder {
    PinCode(Box<dyn FnOnce(String)>),
    Passkey(Box<dyn FnOnce(Option<u32>)>),
    Confirmation(Box<dyn FnOnce(bool)>),
}

impl Responder {
    /// Answer with the value the service reads as "no".
    fn refuse(self) {
        match self {
            Responder::PinCode(reply) => reply(String::new()),
            Responder::Passkey(reply) => reply(None),
            Responder::Confirmation(reply) => reply(false),
        }
    }
}

struct PendingRequest {
    prompt: Prompt,
    responder: Responder,
}

pub struct Agent {
    settings: AgentSettings,
    model: Weak<DeviceModel>,
    weak_self: Weak<Agent>,
    pending: RefCell<Option<PendingRequest>>,
    /// Informational passkey display, if one is showing.
    display: RefCell<Option<Prompt>>,
    timeout: DelayedTask,
    callbacks: Callbacks<AgentEvent>,
}

impl Agent {
    pub fn new(
        model: &Rc<DeviceModel>,
        scheduler: Rc<dyn Scheduler>,
        settings: AgentSettings,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            settings,
            model: Rc::downgrade(model),
            weak_self: weak_self.clone(),
            pending: RefCell::new(None),
            display: RefCell::new(None),
            timeout: DelayedTask::new("agent-response", scheduler),
            callbacks: Callbacks::new(),
        })
    }

    pub fn object_path(&self) -> &str {
        &self.settings.object_path
    }

    pub fn capability(&self) -> &str {
        &self.settings.capability
    }

    pub fn connect<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&AgentEvent) + 'static,
    {
        self.callbacks.register(callback)
    }

    pub fn disconnect(&self, id: CallbackId) -> bool {
        self.callbacks.unregister(id)
    }

    /// The request waiting for an answer, if any.
    pub fn pending_prompt(&self) -> Option<Prompt> {
        self.pending.borrow().as_ref().map(|p| p.prompt.clone())
    }

    /// The passkey display currently shown, if any.
    pub fn display_prompt(&self) -> Option<Prompt> {
        self.display.borrow().clone()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.borrow().is_none() && self.display.borrow().is_none()
    }

    // Service-facing requests

    /// The service is done with the agent. Any outstanding request is
    /// cancelled. Safe to call when idle.
    pub fn release(&self) {
        info!("Agent: released");
        self.end(EndReason::Released);
        self.callbacks.notify(&AgentEvent::Released);
    }

    /// The outstanding request was cancelled. Safe to call when idle.
    pub fn cancel(&self) {
        info!("Agent: cancelled");
        self.end(EndReason::Cancelled);
    }

    pub fn request_pin_code(&self, device_path: &str, reply: Box<dyn FnOnce(String)>) {
        self.begin(device_path, PromptKind::PinCode, Responder::PinCode(reply));
    }

    pub fn request_passkey(&self, device_path: &str, reply: Box<dyn FnOnce(Option<u32>)>) {
        self.begin(device_path, PromptKind::Passkey, Responder::Passkey(reply));
    }

    pub fn request_confirmation(
        &self,
        device_path: &str,
        passkey: u32,
        reply: Box<dyn FnOnce(bool)>,
    ) {
        self.begin(
            device_path,
            PromptKind::Confirmation { passkey },
            Responder::Confirmation(reply),
        );
    }

    /// Progress of a passkey being typed on the remote. Needs no answer.
    pub fn display_passkey(&self, device_path: &str, passkey: u32, entered: u8) {
        let prompt =
            self.prompt_for(device_path, PromptKind::DisplayPasskey { passkey, entered });
        debug!(
            "Agent: displaying passkey for {} ({} digit(s) entered)",
            device_path, entered
        );
        *self.display.borrow_mut() = Some(prompt.clone());
        self.callbacks.notify(&AgentEvent::PromptUpdated(prompt));
    }

    // User-facing answers
    //
    // The agent is idle again before the service sees the answer, so a
    // reply that starts the next request gets a fresh prompt.

    pub fn provide_pin_code(&self, pin: &str) -> Result<()> {
        let responder =
            self.take_responder("pin code", |r| matches!(r, Responder::PinCode(_)))?;
        self.finish(EndReason::Answered);
        match responder {
            Responder::PinCode(reply) => reply(pin.to_string()),
            other => other.refuse(),
        }
        Ok(())
    }

    pub fn provide_passkey(&self, passkey: u32) -> Result<()> {
        let responder =
            self.take_responder("passkey", |r| matches!(r, Responder::Passkey(_)))?;
        self.finish(EndReason::Answered);
        match responder {
            Responder::Passkey(reply) => reply(Some(passkey)),
            other => other.refuse(),
        }
        Ok(())
    }

    pub fn confirm(&self, accept: bool) -> Result<()> {
        let responder =
            self.take_responder("confirmation", |r| matches!(r, Responder::Confirmation(_)))?;
        self.finish(EndReason::Answered);
        match responder {
            Responder::Confirmation(reply) => reply(accept),
            other => other.refuse(),
        }
        Ok(())
    }

    // Internals

    fn prompt_for(&self, device_path: &str, kind: PromptKind) -> Prompt {
        let device = self
            .model
            .upgrade()
            .and_then(|model| model.device_from_path(device_path));
        if device.is_none() {
            debug!("Agent: {} is not in the registry", device_path);
        }
        Prompt {
            device_path: device_path.to_string(),
            device,
            kind,
        }
    }

    fn begin(&self, device_path: &str, kind: PromptKind, responder: Responder) {
        let outstanding = self
            .pending
            .borrow()
            .as_ref()
            .map(|p| (p.prompt.kind, p.prompt.device_path.clone()));
        if let Some((current_kind, current_path)) = outstanding {
            error!(
                "Agent: {} request for {} while a {} request for {} is outstanding, rejecting",
                kind, device_path, current_kind, current_path
            );
            responder.refuse();
            return;
        }

        let prompt = self.prompt_for(device_path, kind);
        info!("Agent: {} requested for {}", kind, device_path);
        *self.pending.borrow_mut() = Some(PendingRequest {
            prompt: prompt.clone(),
            responder,
        });

        let this_weak = self.weak_self.clone();
        self.timeout.arm(self.settings.response_timeout, move || {
            if let Some(this) = this_weak.upgrade() {
                warn!("Agent: no answer in time, cancelling request");
                this.end(EndReason::TimedOut);
            }
        });

        self.callbacks.notify(&AgentEvent::PromptStarted(prompt));
    }

    /// Take the outstanding responder if `matches` accepts it.
    fn take_responder(
        &self,
        what: &'static str,
        matches: impl Fn(&Responder) -> bool,
    ) -> Result<Responder> {
        let mut pending = self.pending.borrow_mut();
        if !pending.as_ref().is_some_and(|p| matches(&p.responder)) {
            return Err(Error::NoPendingRequest(what));
        }
        pending
            .take()
            .map(|p| p.responder)
            .ok_or(Error::NoPendingRequest(what))
    }

    /// Refuse whatever is outstanding and return to idle.
    fn end(&self, reason: EndReason) {
        let pending = self.pending.borrow_mut().take();
        let had_display = self.display.borrow_mut().take().is_some();
        if pending.is_none() && !had_display {
            self.timeout.disarm();
            return;
        }

        self.finish(reason);
        if let Some(request) = pending {
            debug!(
                "Agent: ended {} request for {} ({:?})",
                request.prompt.kind, request.prompt.device_path, reason
            );
            request.responder.refuse();
        }
    }

    fn finish(&self, reason: EndReason) {
        self.timeout.disarm();
        self.display.borrow_mut().take();
        self.callbacks.notify(&AgentEvent::PromptEnded(reason));
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // The service is still waiting on an answer.
        if let Some(request) = self.pending.get_mut().take() {
            request.responder.refuse();
        }
    }
}

//! Scripted replays.
//!
//! A replay drives a [`BluetoothPanel`] against a [`ScriptedService`] on a
//! virtual clock. The script is a JSON list of steps: service events,
//! replies to outstanding calls, clock advances, user actions and agent
//! traffic. Everything observable (outbound calls, panel and agent
//! notifications, agent answers) is written to a transcript.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use bluepanel_core::{
    Adapter, AgentEvent, BluetoothPanel, Call, Config, Device, ManualScheduler, PanelEvent,
    ReplyValue, ScriptedService, ServiceError, ServiceEvent,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse script {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// Deliver a service signal.
    Event(ServiceEvent),
    /// Resolve the oldest pending call to `method`. Fails the call when
    /// `error` is present.
    Reply {
        method: String,
        #[serde(default)]
        ok: Option<ReplyValue>,
        #[serde(default)]
        error: Option<ServiceError>,
    },
    /// Move the virtual clock forward.
    AdvanceMs(u64),
    Action(Action),
    Agent(AgentStep),
    /// Write a status snapshot to the transcript.
    Status,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Action {
    Select { address: Option<String> },
    ConnectDevice { address: String },
    DisconnectDevice,
    RemoveDevice,
    StartDiscovery,
    StopDiscovery,
    ToggleDiscovery,
    SetDiscoverable { enabled: bool },
    SetPowered { enabled: bool },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum AgentStep {
    RequestPinCode { device_path: String },
    RequestPasskey { device_path: String },
    RequestConfirmation { device_path: String, passkey: u32 },
    DisplayPasskey { device_path: String, passkey: u32, entered: u8 },
    Cancel,
    Release,
    ProvidePinCode { pin: String },
    ProvidePasskey { passkey: u32 },
    Confirm { accept: bool },
}

/// Point-in-time view of the panel.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub time_ms: u128,
    pub adapter_path: Option<String>,
    pub adapter: Adapter,
    pub selected: Option<String>,
    pub connected: Vec<Device>,
    pub disconnected: Vec<Device>,
    pub prompt: Option<String>,
    pub pending_calls: Vec<Call>,
}

type Transcript = Rc<RefCell<Vec<String>>>;

pub struct Replay {
    service: Rc<ScriptedService>,
    scheduler: Rc<ManualScheduler>,
    panel: Rc<BluetoothPanel>,
    transcript: Transcript,
    reported_calls: usize,
}

impl Replay {
    pub fn new(config: &Config) -> Self {
        let service = Rc::new(ScriptedService::new());
        let scheduler = Rc::new(ManualScheduler::new());
        let panel = BluetoothPanel::new(service.clone(), scheduler.clone(), config);
        let transcript: Transcript = Rc::new(RefCell::new(Vec::new()));

        let clock = scheduler.clone();
        let sink = transcript.clone();
        panel.connect(move |event| {
            sink.borrow_mut()
                .push(stamp(clock.now(), &describe_panel_event(event)));
        });

        let clock = scheduler.clone();
        let sink = transcript.clone();
        panel.agent().connect(move |event| {
            sink.borrow_mut()
                .push(stamp(clock.now(), &describe_agent_event(event)));
        });

        Self {
            service,
            scheduler,
            panel,
            transcript,
            reported_calls: 0,
        }
    }

    pub fn panel(&self) -> &Rc<BluetoothPanel> {
        &self.panel
    }

    pub fn service(&self) -> &Rc<ScriptedService> {
        &self.service
    }

    pub fn transcript(&self) -> Vec<String> {
        self.transcript.borrow().clone()
    }

    /// Run every step in order. Stops at the first step the script got
    /// wrong (for example a reply to a call that was never made).
    pub fn run(&mut self, script: &Script) -> Result<()> {
        if let Some(description) = &script.description {
            self.note(&format!("script: {}", description));
        }
        for (index, step) in script.steps.iter().enumerate() {
            self.step(step)
                .with_context(|| format!("step {} ({:?}) failed", index + 1, step))?;
        }
        Ok(())
    }

    pub fn step(&mut self, step: &Step) -> Result<()> {
        debug!("Replay: {:?}", step);
        match step {
            Step::Event(event) => self.panel.ingest(event.clone()),
            Step::Reply { method, ok, error } => {
                let result = match error {
                    Some(error) => Err(error.clone()),
                    None => Ok(ok.clone().unwrap_or(ReplyValue::Unit)),
                };
                let call = self.service.complete(method, result)?;
                self.note(&format!("reply {} #{}", call.method, call.id));
            }
            Step::AdvanceMs(ms) => {
                let fired = self.scheduler.advance(Duration::from_millis(*ms));
                debug!("Replay: advanced {}ms, {} timer(s) fired", ms, fired);
            }
            Step::Action(action) => self.action(action),
            Step::Agent(agent) => self.agent(agent),
            Step::Status => {
                let status = serde_json::to_string_pretty(&self.snapshot())?;
                self.note(&format!("status {}", status));
            }
        }
        self.report_new_calls();
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        let model = self.panel.model();
        Snapshot {
            time_ms: self.scheduler.now().as_millis(),
            adapter_path: model.adapter_path(),
            adapter: model.adapter(),
            selected: self.panel.selected_address(),
            connected: self.panel.connected_devices().devices(),
            disconnected: self.panel.disconnected_devices().devices(),
            prompt: self.panel.agent().pending_prompt().map(|p| {
                format!("{} for {}", p.kind, p.device_path)
            }),
            pending_calls: self.service.pending(),
        }
    }

    /// User actions report refusals in the transcript instead of failing
    /// the replay; rejecting them is part of the behaviour being replayed.
    fn action(&self, action: &Action) {
        let model = self.panel.model();
        let result = match action {
            Action::Select { address } => {
                self.panel.set_selected_device(address.as_deref());
                Ok(())
            }
            Action::ConnectDevice { address } => self.panel.connect_device(address),
            Action::DisconnectDevice => self.panel.disconnect_device(),
            Action::RemoveDevice => self.panel.remove_device(),
            Action::StartDiscovery => model.start_discovery(),
            Action::StopDiscovery => model.stop_discovery(),
            Action::ToggleDiscovery => model.toggle_discovery(),
            Action::SetDiscoverable { enabled } => model.try_set_discoverable(*enabled),
            Action::SetPowered { enabled } => model.set_powered(*enabled),
        };
        if let Err(e) = result {
            self.note(&format!("refused {:?}: {}", action, e));
        }
    }

    fn agent(&self, step: &AgentStep) {
        let agent = self.panel.agent();
        let result = match step {
            AgentStep::RequestPinCode { device_path } => {
                let answer = self.answer_sink("pin code");
                agent.request_pin_code(
                    device_path,
                    Box::new(move |pin| answer(format!("{:?}", pin))),
                );
                Ok(())
            }
            AgentStep::RequestPasskey { device_path } => {
                let answer = self.answer_sink("passkey");
                agent.request_passkey(
                    device_path,
                    Box::new(move |passkey| match passkey {
                        Some(passkey) => answer(format!("{:06}", passkey)),
                        None => answer("rejected".to_string()),
                    }),
                );
                Ok(())
            }
            AgentStep::RequestConfirmation {
                device_path,
                passkey,
            } => {
                let answer = self.answer_sink("confirmation");
                agent.request_confirmation(
                    device_path,
                    *passkey,
                    Box::new(move |accepted| answer(accepted.to_string())),
                );
                Ok(())
            }
            AgentStep::DisplayPasskey {
                device_path,
                passkey,
                entered,
            } => {
                agent.display_passkey(device_path, *passkey, *entered);
                Ok(())
            }
            AgentStep::Cancel => {
                agent.cancel();
                Ok(())
            }
            AgentStep::Release => {
                agent.release();
                Ok(())
            }
            AgentStep::ProvidePinCode { pin } => agent.provide_pin_code(pin),
            AgentStep::ProvidePasskey { passkey } => agent.provide_passkey(*passkey),
            AgentStep::Confirm { accept } => agent.confirm(*accept),
        };
        if let Err(e) = result {
            self.note(&format!("refused {:?}: {}", step, e));
        }
    }

    /// A closure that records what the agent answered the service.
    fn answer_sink(&self, what: &'static str) -> impl Fn(String) + 'static {
        let clock = self.scheduler.clone();
        let sink = self.transcript.clone();
        move |value| {
            sink.borrow_mut()
                .push(stamp(clock.now(), &format!("agent answered {}: {}", what, value)));
        }
    }

    fn report_new_calls(&mut self) {
        let history = self.service.history();
        for call in &history[self.reported_calls.min(history.len())..] {
            let line = format!("call {} #{} {}", call.method, call.id, call.args.join(" "));
            self.note(line.trim_end());
        }
        self.reported_calls = history.len();
    }

    fn note(&self, line: &str) {
        self.transcript
            .borrow_mut()
            .push(stamp(self.scheduler.now(), line));
    }
}

fn stamp(now: Duration, line: &str) -> String {
    format!("[{:>9.3}s] {}", now.as_secs_f64(), line)
}

fn describe_panel_event(event: &PanelEvent) -> String {
    match event {
        PanelEvent::SelectedDeviceChanged(Some(device)) => format!(
            "selected {} ({}, {:?}{})",
            device.address,
            device.display_name(),
            device.connection,
            if device.paired { ", paired" } else { "" }
        ),
        PanelEvent::SelectedDeviceChanged(None) => "selected nothing".to_string(),
        PanelEvent::DiscoveringChanged(v) => format!("discovering {}", v),
        PanelEvent::DiscoverableChanged(v) => format!("discoverable {}", v),
        PanelEvent::PoweredChanged(v) => format!("powered {}", v),
        PanelEvent::AdapterNameChanged(name) => format!("adapter name {:?}", name),
    }
}

fn describe_agent_event(event: &AgentEvent) -> String {
    let mut line = String::from("agent ");
    let _ = match event {
        AgentEvent::PromptStarted(prompt) => write!(
            line,
            "prompt {} for {}{}",
            prompt.kind,
            prompt.device_path,
            prompt
                .device
                .as_ref()
                .map(|d| format!(" ({})", d.display_name()))
                .unwrap_or_default()
        ),
        AgentEvent::PromptUpdated(prompt) => write!(line, "showing {:?}", prompt.kind),
        AgentEvent::PromptEnded(reason) => write!(line, "prompt ended: {:?}", reason),
        AgentEvent::Released => write!(line, "released"),
    };
    line
}

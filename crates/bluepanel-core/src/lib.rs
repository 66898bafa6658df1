//! bluepanel-core - Bluetooth discovery and pairing coordinator.
//!
//! Tracks the BlueZ adapter, keeps an ordered registry of nearby and known
//! devices, relays pairing prompts through an agent and exposes filtered
//! device lists. The IPC transport and the UI are supplied by the embedder
//! through [`BluezService`], [`Scheduler`] and the `connect` listeners.

pub mod adapter;
pub mod agent;
pub mod callbacks;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod filter;
pub mod logging;
pub mod model;
pub mod panel;
pub mod registry;
pub mod scripted;
pub mod service;
pub mod timer;

pub use adapter::{Adapter, AdapterChange};
pub use agent::{Agent, AgentEvent, AgentSettings, EndReason, Prompt, PromptKind};
pub use callbacks::{CallbackId, Callbacks};
pub use config::Config;
pub use device::{Connection, ConnectionMode, Device, DeviceType, Strength};
pub use error::{Error, Result};
pub use event::ServiceEvent;
pub use filter::{DeviceFilter, FilteredView, SortOrder, ViewEvent};
pub use model::{DeviceModel, ModelEvent, ModelSettings};
pub use panel::{BluetoothPanel, PanelEvent};
pub use registry::{DeviceRegistry, RowChange};
pub use scripted::{Call, ReplyValue, ScriptedError, ScriptedService};
pub use service::{BluezService, DeviceObject, PropertyMap, PropertyValue, ServiceError};
pub use timer::{DelayedTask, ManualScheduler, Scheduler, TimerToken};

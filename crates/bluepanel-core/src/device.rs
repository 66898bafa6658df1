//! Remote device state and BlueZ property decoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::service::{PropertyMap, PropertyValue, property};

/// Kind of remote device, derived from its class of device, icon or an
/// explicit `Type` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Unknown,
    Computer,
    Phone,
    Modem,
    Network,
    Headset,
    Headphones,
    Speakers,
    Carkit,
    OtherAudio,
    Keyboard,
    Mouse,
    Tablet,
    Joypad,
    Printer,
    Camera,
    Video,
    Watch,
}

impl DeviceType {
    pub const ALL: [DeviceType; 18] = [
        DeviceType::Unknown,
        DeviceType::Computer,
        DeviceType::Phone,
        DeviceType::Modem,
        DeviceType::Network,
        DeviceType::Headset,
        DeviceType::Headphones,
        DeviceType::Speakers,
        DeviceType::Carkit,
        DeviceType::OtherAudio,
        DeviceType::Keyboard,
        DeviceType::Mouse,
        DeviceType::Tablet,
        DeviceType::Joypad,
        DeviceType::Printer,
        DeviceType::Camera,
        DeviceType::Video,
        DeviceType::Watch,
    ];

    /// Decode a Bluetooth class-of-device value.
    ///
    /// Bits 8-12 hold the major class, bits 2-7 the minor class.
    pub fn from_class(class: u32) -> Self {
        let major = (class >> 8) & 0x1f;
        let minor = (class >> 2) & 0x3f;

        match major {
            0x01 => DeviceType::Computer,
            0x02 => match minor {
                0x04 | 0x05 => DeviceType::Modem,
                _ => DeviceType::Phone,
            },
            0x03 => DeviceType::Network,
            0x04 => match minor {
                0x01 | 0x02 => DeviceType::Headset,
                0x05 => DeviceType::Speakers,
                0x06 => DeviceType::Headphones,
                0x08 => DeviceType::Carkit,
                0x0b | 0x0c | 0x0d => DeviceType::Video,
                _ => DeviceType::OtherAudio,
            },
            0x05 => {
                if minor & 0x10 != 0 {
                    DeviceType::Keyboard
                } else if minor & 0x20 != 0 {
                    DeviceType::Mouse
                } else {
                    match minor & 0x0f {
                        0x01 | 0x02 => DeviceType::Joypad,
                        0x05 => DeviceType::Tablet,
                        _ => DeviceType::Unknown,
                    }
                }
            }
            0x06 => {
                if class & 0x80 != 0 {
                    DeviceType::Printer
                } else if class & 0x20 != 0 {
                    DeviceType::Camera
                } else {
                    DeviceType::Unknown
                }
            }
            0x07 => DeviceType::Watch,
            _ => DeviceType::Unknown,
        }
    }

    /// Guess the type from a freedesktop icon name.
    pub fn from_icon(icon: &str) -> Self {
        match icon {
            "computer" => DeviceType::Computer,
            "phone" => DeviceType::Phone,
            "modem" => DeviceType::Modem,
            "network-wireless" => DeviceType::Network,
            "audio-headset" => DeviceType::Headset,
            "audio-headphones" => DeviceType::Headphones,
            "audio-card" => DeviceType::OtherAudio,
            "input-keyboard" => DeviceType::Keyboard,
            "input-mouse" => DeviceType::Mouse,
            "input-tablet" => DeviceType::Tablet,
            "input-gaming" => DeviceType::Joypad,
            "printer" => DeviceType::Printer,
            "camera-photo" => DeviceType::Camera,
            "camera-video" => DeviceType::Video,
            _ => DeviceType::Unknown,
        }
    }

    /// Icon used when the service did not report one.
    pub fn icon_name(self) -> &'static str {
        match self {
            DeviceType::Computer => "computer",
            DeviceType::Phone => "phone",
            DeviceType::Modem => "modem",
            DeviceType::Network => "network-wireless",
            DeviceType::Headset => "audio-headset",
            DeviceType::Headphones => "audio-headphones",
            DeviceType::Speakers | DeviceType::Carkit | DeviceType::OtherAudio => "audio-card",
            DeviceType::Keyboard => "input-keyboard",
            DeviceType::Mouse => "input-mouse",
            DeviceType::Tablet => "input-tablet",
            DeviceType::Joypad => "input-gaming",
            DeviceType::Printer => "printer",
            DeviceType::Camera => "camera-photo",
            DeviceType::Video => "camera-video",
            DeviceType::Watch | DeviceType::Unknown => "bluetooth",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Unknown => "unknown",
            DeviceType::Computer => "computer",
            DeviceType::Phone => "phone",
            DeviceType::Modem => "modem",
            DeviceType::Network => "network",
            DeviceType::Headset => "headset",
            DeviceType::Headphones => "headphones",
            DeviceType::Speakers => "speakers",
            DeviceType::Carkit => "carkit",
            DeviceType::OtherAudio => "other-audio",
            DeviceType::Keyboard => "keyboard",
            DeviceType::Mouse => "mouse",
            DeviceType::Tablet => "tablet",
            DeviceType::Joypad => "joypad",
            DeviceType::Printer => "printer",
            DeviceType::Camera => "camera",
            DeviceType::Video => "video",
            DeviceType::Watch => "watch",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "audio" | "other-audio" => Ok(DeviceType::OtherAudio),
            "peripheral" | "input" => Ok(DeviceType::Unknown),
            _ => DeviceType::ALL
                .iter()
                .copied()
                .find(|t| t.as_str() == lower)
                .ok_or(()),
        }
    }
}

/// Link state of a device, as confirmed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl Connection {
    pub const ALL: [Connection; 4] = [
        Connection::Disconnected,
        Connection::Connecting,
        Connection::Connected,
        Connection::Disconnecting,
    ];

    /// Display rank: connected devices sort first.
    pub fn rank(self) -> u8 {
        match self {
            Connection::Connected => 0,
            Connection::Connecting => 1,
            Connection::Disconnecting => 2,
            Connection::Disconnected => 3,
        }
    }
}

impl FromStr for Connection {
    type Err = ();

    /// Parse a BlueZ audio/input `State` value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disconnected" => Ok(Connection::Disconnected),
            "connecting" => Ok(Connection::Connecting),
            "connected" | "playing" => Ok(Connection::Connected),
            "disconnecting" => Ok(Connection::Disconnecting),
            _ => Err(()),
        }
    }
}

/// Profile to connect once a device is paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    Audio,
    AudioSink,
    AudioSource,
    Headset,
    HandsfreeGateway,
    Input,
}

impl ConnectionMode {
    /// Default profile for a device type, if the type has one.
    pub fn for_type(device_type: DeviceType) -> Option<Self> {
        match device_type {
            DeviceType::Headset => Some(ConnectionMode::Headset),
            DeviceType::Headphones
            | DeviceType::Speakers
            | DeviceType::Carkit
            | DeviceType::OtherAudio => Some(ConnectionMode::Audio),
            DeviceType::Phone => Some(ConnectionMode::HandsfreeGateway),
            DeviceType::Keyboard | DeviceType::Mouse | DeviceType::Tablet | DeviceType::Joypad => {
                Some(ConnectionMode::Input)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Audio => "audio",
            ConnectionMode::AudioSink => "audio-sink",
            ConnectionMode::AudioSource => "audio-source",
            ConnectionMode::Headset => "headset",
            ConnectionMode::HandsfreeGateway => "handsfree-gateway",
            ConnectionMode::Input => "input",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse signal strength bucket for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strength {
    None,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl Strength {
    /// Bucket an RSSI reading in dBm.
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r >= -60 => Strength::Excellent,
            r if r >= -70 => Strength::Good,
            r if r >= -80 => Strength::Fair,
            r if r >= -90 => Strength::Poor,
            _ => Strength::None,
        }
    }
}

/// A single remote device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub address: String,
    /// Service object path; empty for devices only seen by a scan.
    pub path: String,
    pub name: String,
    pub device_type: DeviceType,
    pub icon: String,
    /// Last RSSI reading in dBm, only present while scanning.
    pub rssi: Option<i16>,
    pub connection: Connection,
    pub trusted: bool,
    pub paired: bool,
}

impl Device {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: String::new(),
            name: String::new(),
            device_type: DeviceType::Unknown,
            icon: String::new(),
            rssi: None,
            connection: Connection::Disconnected,
            trusted: false,
            paired: false,
        }
    }

    /// Build a device from a property map. Returns `None` without an
    /// `Address` property.
    pub fn from_properties(path: &str, props: &PropertyMap) -> Option<Self> {
        let address = property(props, "Address")?.as_str()?;
        if address.is_empty() {
            return None;
        }

        let mut device = Device::new(address);
        device.path = path.to_string();
        device.merge_properties(props);
        Some(device)
    }

    pub fn has_path(&self) -> bool {
        !self.path.is_empty()
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }

    /// Icon for display, falling back to the type's default icon.
    pub fn icon_name(&self) -> &str {
        if self.icon.is_empty() {
            self.device_type.icon_name()
        } else {
            &self.icon
        }
    }

    pub fn strength(&self) -> Strength {
        self.rssi.map(Strength::from_rssi).unwrap_or(Strength::None)
    }

    /// Apply every property in `props`. Malformed or unknown entries are
    /// skipped individually. Returns true if anything changed.
    pub fn merge_properties(&mut self, props: &PropertyMap) -> bool {
        let mut changed = false;
        for (key, value) in props {
            changed |= self.update_property(key, value);
        }
        changed
    }

    /// Apply a single property. Returns true if the device changed.
    pub fn update_property(&mut self, key: &str, value: &PropertyValue) -> bool {
        let key = key.to_ascii_lowercase();
        match key.as_str() {
            // The address is the registry key and never changes.
            "address" => false,
            "name" | "alias" => match value.as_str() {
                Some(name) => set(&mut self.name, name.to_string()),
                None => malformed(&self.address, &key, value),
            },
            "type" => match value.as_str().map(str::parse::<DeviceType>) {
                Some(Ok(t)) => set(&mut self.device_type, t),
                _ => malformed(&self.address, &key, value),
            },
            "class" => match value.as_i64().and_then(|c| u32::try_from(c).ok()) {
                Some(class) => set(&mut self.device_type, DeviceType::from_class(class)),
                None => malformed(&self.address, &key, value),
            },
            "icon" => match value.as_str() {
                Some(icon) => {
                    let mut changed = set(&mut self.icon, icon.to_string());
                    if self.device_type == DeviceType::Unknown {
                        changed |= set(&mut self.device_type, DeviceType::from_icon(icon));
                    }
                    changed
                }
                None => malformed(&self.address, &key, value),
            },
            "rssi" => match value.as_i64().and_then(|r| i16::try_from(r).ok()) {
                Some(rssi) => set(&mut self.rssi, Some(rssi)),
                None => malformed(&self.address, &key, value),
            },
            "connected" => match value.as_bool() {
                Some(true) => set(&mut self.connection, Connection::Connected),
                Some(false) => set(&mut self.connection, Connection::Disconnected),
                None => malformed(&self.address, &key, value),
            },
            "state" => match value.as_str().map(str::parse::<Connection>) {
                Some(Ok(state)) => set(&mut self.connection, state),
                _ => malformed(&self.address, &key, value),
            },
            "trusted" => match value.as_bool() {
                Some(trusted) => set(&mut self.trusted, trusted),
                None => malformed(&self.address, &key, value),
            },
            "paired" => match value.as_bool() {
                Some(paired) => set(&mut self.paired, paired),
                None => malformed(&self.address, &key, value),
            },
            _ => {
                trace!("Device {}: ignoring property {}", self.address, key);
                false
            }
        }
    }
}

fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn malformed(address: &str, key: &str, value: &PropertyValue) -> bool {
    warn!(
        "Device {}: ignoring malformed property {} = {:?}",
        address, key, value
    );
    false
}

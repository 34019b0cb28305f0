use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used for `last_initiated` in the registry file.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One persisted hub entry.
///
/// Field names follow the on-disk JSON layout (`hub_name`, `ble_id`, `new`,
/// `last_initiated`) so existing mapping files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubRecord {
    #[serde(rename = "hub_name")]
    pub display_name: String,
    #[serde(rename = "ble_id")]
    pub identity: String,
    /// True until the user has confirmed a name for this hub.
    #[serde(rename = "new", default)]
    pub first_seen: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp_format"
    )]
    pub last_initiated: Option<NaiveDateTime>,
}

impl HubRecord {
    pub fn discovered(identity: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            identity: identity.into(),
            first_seen: true,
            last_initiated: None,
        }
    }
}

mod timestamp_format {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

/// A peripheral reported by the BLE scan capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: Option<String>,
    pub address: String,
}

/// A scanned peripheral that matched the hub name signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHub {
    pub identity: String,
    pub advertised_name: String,
}

/// Lifecycle of a single hub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Running,
    Disconnecting,
    Errored,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Errored)
                | (Connected, Running)
                | (Connected, Errored)
                | (Connected, Disconnecting)
                | (Running, Disconnecting)
                | (Running, Errored)
                | (Disconnecting, Disconnected)
                | (Errored, Disconnected)
        )
    }
}

/// Kinds of device capability a hub session can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    TrainMotor,
    VisionSensor,
}

/// Vision sensor sub-capabilities. Discriminants are the LWP3 mode numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    SenseColor = 0,
    SenseDistance = 1,
    SenseReflectivity = 3,
    SenseAmbient = 4,
}

impl SensorMode {
    pub fn mode_number(self) -> u8 {
        self as u8
    }
}

/// Declares one capability attached to a hub: what it is, where it is
/// plugged in, and which sensor sub-capabilities are active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub kind: CapabilityKind,
    pub port: u8,
    pub sub_capabilities: Vec<SensorMode>,
}

impl CapabilityDescriptor {
    pub fn motor(name: impl Into<String>, port: u8) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::TrainMotor,
            port,
            sub_capabilities: Vec::new(),
        }
    }

    pub fn vision_sensor(name: impl Into<String>, port: u8, modes: &[SensorMode]) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::VisionSensor,
            port,
            sub_capabilities: modes.to_vec(),
        }
    }
}

/// Full attachment configuration for one hub session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubDescriptor {
    pub capabilities: Vec<CapabilityDescriptor>,
}

impl HubDescriptor {
    pub fn with(mut self, capability: CapabilityDescriptor) -> Self {
        self.capabilities.push(capability);
        self
    }
}

/// LEGO colour indices as reported by the vision sensor in colour mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Black,
    Pink,
    Purple,
    Blue,
    LightBlue,
    Cyan,
    Green,
    Yellow,
    Orange,
    Red,
    White,
    None,
    Unknown(u8),
}

impl From<u8> for Color {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Color::Black,
            1 => Color::Pink,
            2 => Color::Purple,
            3 => Color::Blue,
            4 => Color::LightBlue,
            5 => Color::Cyan,
            6 => Color::Green,
            7 => Color::Yellow,
            8 => Color::Orange,
            9 => Color::Red,
            10 => Color::White,
            255 => Color::None,
            other => Color::Unknown(other),
        }
    }
}

impl From<Color> for u8 {
    fn from(color: Color) -> Self {
        match color {
            Color::Black => 0,
            Color::Pink => 1,
            Color::Purple => 2,
            Color::Blue => 3,
            Color::LightBlue => 4,
            Color::Cyan => 5,
            Color::Green => 6,
            Color::Yellow => 7,
            Color::Orange => 8,
            Color::Red => 9,
            Color::White => 10,
            Color::None => 255,
            Color::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Unknown(raw) => write!(f, "unknown({raw})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// A decoded sensor notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorValue {
    Color(Color),
    Distance(u8),
    Reflectivity(u8),
    Ambient(u8),
}

/// Observable session activity, published to an optional listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        identity: String,
        state: ConnectionState,
    },
    SensorChanged {
        identity: String,
        capability: String,
        value: SensorValue,
    },
}

use crate::domain::error::ErrorReply;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Controller index used by the management protocol for "no controller".
pub const INDEX_NONE: u16 = 0xFFFF;

/// RSSI value reported when the radio did not measure signal strength.
pub const RSSI_UNKNOWN: i8 = 0;

/// Bluetooth device address.
///
/// Stored in wire order (least significant byte first), displayed in the
/// conventional most-significant-first `XX:XX:XX:XX:XX:XX` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const ANY: BdAddr = BdAddr([0; 6]);

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Object-path friendly form, e.g. `dev_00_11_22_33_44_55`.
    pub fn path_component(&self) -> String {
        format!("dev_{}", self.to_string().replace(':', "_"))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrParseError(pub String);

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", self.0)
    }
}

impl std::error::Error for AddrParseError {}

impl FromStr for BdAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddrParseError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(AddrParseError(s.to_string()));
            }
            bytes[5 - i] =
                u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
        }
        Ok(BdAddr(bytes))
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Policy-level visibility of a controller.
///
/// Ordered so that `max` over a set of requests yields the most visible one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Off,
    Connectable,
    Discoverable,
    #[serde(rename = "limited")]
    LimitedDiscoverable,
}

impl Mode {
    /// Label persisted in per-controller settings. Limited discoverability
    /// is stored as plain "discoverable".
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Connectable => "connectable",
            Mode::Discoverable | Mode::LimitedDiscoverable => "discoverable",
        }
    }

    /// Parse a stored or configured mode label. "on" is resolved by the
    /// caller because it depends on the stored power-on mode.
    pub fn parse(label: &str) -> Option<Mode> {
        match label.to_ascii_lowercase().as_str() {
            "off" => Some(Mode::Off),
            "connectable" => Some(Mode::Connectable),
            "discoverable" => Some(Mode::Discoverable),
            "limited" => Some(Mode::LimitedDiscoverable),
            _ => None,
        }
    }

    pub fn scan_mode(&self) -> ScanMode {
        match self {
            Mode::Off => ScanMode::DISABLED,
            Mode::Connectable => ScanMode::PAGE,
            Mode::Discoverable | Mode::LimitedDiscoverable => ScanMode::PAGE_INQUIRY,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware scan-enable bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScanMode(pub u8);

impl ScanMode {
    pub const DISABLED: ScanMode = ScanMode(0x00);
    pub const INQUIRY: ScanMode = ScanMode(0x01);
    pub const PAGE: ScanMode = ScanMode(0x02);
    pub const PAGE_INQUIRY: ScanMode = ScanMode(0x03);

    pub fn is_disabled(&self) -> bool {
        self.0 == 0
    }

    pub fn page(&self) -> bool {
        self.0 & Self::PAGE.0 != 0
    }

    pub fn inquiry(&self) -> bool {
        self.0 & Self::INQUIRY.0 != 0
    }

    pub fn without_inquiry(&self) -> ScanMode {
        ScanMode(self.0 & !Self::INQUIRY.0)
    }
}

/// Remote-name resolution status of a found device.
///
/// Ordered by escalation: a sighting may move a device up this list but
/// never down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameStatus {
    NotRequired,
    /// A name is wanted but has not been asked for yet.
    Any,
    Requested,
}

impl NameStatus {
    pub fn escalate(self, hint: NameStatus) -> NameStatus {
        self.max(hint)
    }
}

/// Identity of an RPC client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Where a deferred reply must be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplyTo {
    pub client: ClientId,
    pub serial: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    Str(String),
    List(Vec<String>),
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Pack a 3-byte class of device into its numeric form.
pub fn class_to_u32(class: [u8; 3]) -> u32 {
    class[0] as u32 | (class[1] as u32) << 8 | (class[2] as u32) << 16
}

pub fn class_from_u32(value: u32) -> [u8; 3] {
    [value as u8, (value >> 8) as u8, (value >> 16) as u8]
}

/// Outbound notifications produced by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal")]
pub enum Signal {
    PropertyChanged {
        adapter: u16,
        name: String,
        value: PropertyValue,
    },
    DeviceFound {
        adapter: u16,
        address: BdAddr,
        properties: Properties,
    },
    DeviceDisappeared {
        adapter: u16,
        address: String,
    },
    DeviceCreated {
        adapter: u16,
        path: String,
    },
    DeviceRemoved {
        adapter: u16,
        path: String,
    },
    AdapterAdded {
        adapter: u16,
    },
    AdapterRemoved {
        adapter: u16,
    },
    /// Ask the registered agent to confirm a mode change.
    AgentRequest {
        agent: ClientId,
        request_id: u64,
        adapter: u16,
        mode: Mode,
    },
    /// Completion of a call whose reply was deferred.
    DeferredReply {
        reply_to: ReplyTo,
        result: Result<(), ErrorReply>,
    },
}

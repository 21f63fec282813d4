use crate::domain::error::{Error, Result};
use crate::domain::models::{BdAddr, ClientId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A remote device object known to an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub address: BdAddr,
    pub path: String,
    /// Created implicitly (e.g. by an incoming connection) and dropped
    /// again on disconnect.
    pub temporary: bool,
    pub trusted: bool,
}

impl RemoteDevice {
    pub fn new(adapter_path: &str, address: BdAddr, temporary: bool) -> Self {
        Self {
            address,
            path: format!("{}/{}", adapter_path, address.path_component()),
            temporary,
            trusted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputOutput,
}

impl FromStr for IoCapability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // An empty capability keeps the legacy default.
            "" | "DisplayYesNo" => Ok(IoCapability::DisplayYesNo),
            "DisplayOnly" => Ok(IoCapability::DisplayOnly),
            "KeyboardOnly" => Ok(IoCapability::KeyboardOnly),
            "NoInputOutput" => Ok(IoCapability::NoInputOutput),
            other => Err(Error::InvalidArguments(format!(
                "unknown IO capability: {}",
                other
            ))),
        }
    }
}

/// The pairing/authorization agent registered for an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub client: ClientId,
    pub path: String,
    pub capability: IoCapability,
}

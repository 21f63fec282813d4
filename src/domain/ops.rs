//! Seams between the adapter core and the outside world.
//!
//! [`ControllerOps`] is everything the state machine may ask of the radio;
//! [`SettingsStore`] is the per-controller key/value persistence. Both are
//! called inline from the event loop.

use crate::domain::error::Result;
use crate::domain::models::{BdAddr, Mode, ScanMode};

/// General/unlimited inquiry access code, least significant byte first.
pub const GIAC_LAP: [u8; 3] = [0x33, 0x8b, 0x9e];

pub trait ControllerOps {
    fn set_powered(&mut self, index: u16, powered: bool) -> Result<()>;
    fn set_discoverable(&mut self, index: u16, discoverable: bool) -> Result<()>;
    fn set_pairable(&mut self, index: u16, pairable: bool) -> Result<()>;
    fn write_scan_enable(&mut self, index: u16, scan: ScanMode) -> Result<()>;
    /// Switch the inquiry access code between limited and general
    /// discoverability and adjust the limited bit of `class`.
    fn set_limited_discoverable(&mut self, index: u16, class: [u8; 3], limited: bool)
        -> Result<()>;
    fn set_dev_class(&mut self, index: u16, class: [u8; 3]) -> Result<()>;
    fn set_local_name(&mut self, index: u16, name: &str) -> Result<()>;
    fn start_inquiry(&mut self, index: u16, lap: [u8; 3], length: u8) -> Result<()>;
    fn start_periodic_inquiry(
        &mut self,
        index: u16,
        lap: [u8; 3],
        min_period: u16,
        max_period: u16,
        length: u8,
    ) -> Result<()>;
    fn cancel_inquiry(&mut self, index: u16) -> Result<()>;
    fn exit_periodic_inquiry(&mut self, index: u16) -> Result<()>;
    fn resolve_name(&mut self, index: u16, address: BdAddr) -> Result<()>;
    fn cancel_resolve_name(&mut self, index: u16, address: BdAddr) -> Result<()>;
}

/// Stored keys, per controller address.
pub mod keys {
    use crate::domain::models::BdAddr;

    pub const MODE: &str = "mode";
    pub const ON_MODE: &str = "onmode";
    pub const DISCOVERABLE_TIMEOUT: &str = "discovto";
    pub const PAIRABLE_TIMEOUT: &str = "pairto";
    pub const PAIRABLE: &str = "pairable";
    pub const CLASS: &str = "class";
    pub const NAME: &str = "name";

    pub const TRUSTED: &str = "trusted:";
    pub const PROFILES: &str = "profiles:";
    pub const LINK_KEY: &str = "linkkey:";
    pub const REMOTE_NAME: &str = "names:";
    pub const ALIAS: &str = "aliases:";

    pub fn remote(prefix: &str, peer: &BdAddr) -> String {
        format!("{}{}", prefix, peer)
    }
}

pub trait SettingsStore {
    fn read(&self, controller: &BdAddr, key: &str) -> Option<String>;
    fn write(&mut self, controller: &BdAddr, key: &str, value: &str) -> Result<()>;
    fn delete(&mut self, controller: &BdAddr, key: &str) -> Result<()>;
    /// Every stored key of `controller` starting with `prefix`.
    fn keys_with_prefix(&self, controller: &BdAddr, prefix: &str) -> Vec<String>;

    fn read_u32(&self, controller: &BdAddr, key: &str) -> Option<u32> {
        self.read(controller, key)?.trim().parse().ok()
    }

    fn read_bool(&self, controller: &BdAddr, key: &str) -> Option<bool> {
        match self.read(controller, key)?.trim() {
            "yes" => Some(true),
            "no" => Some(false),
            _ => None,
        }
    }

    fn write_bool(&mut self, controller: &BdAddr, key: &str, value: bool) -> Result<()> {
        self.write(controller, key, if value { "yes" } else { "no" })
    }

    /// Persist the mode label. Any mode other than off is also remembered
    /// as the mode to return to when powered back on.
    fn write_mode(&mut self, controller: &BdAddr, mode: Mode) -> Result<()> {
        self.write(controller, keys::MODE, mode.as_str())?;
        if mode != Mode::Off {
            self.write(controller, keys::ON_MODE, mode.as_str())?;
        }
        Ok(())
    }

    /// Resolve the "on" mode: the last non-off mode, or connectable.
    fn read_on_mode(&self, controller: &BdAddr) -> Mode {
        self.read(controller, keys::ON_MODE)
            .and_then(|label| Mode::parse(&label))
            .filter(|mode| *mode != Mode::Off)
            .unwrap_or(Mode::Connectable)
    }
}

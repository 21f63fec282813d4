//! Controller registry.
//!
//! One slot per hardware index, owned by the management client. Slots are
//! created by "index added" (or the startup enumeration), filled by read-info
//! replies and invalidated by "index removed".

use crate::domain::error::{Error, Result};
use crate::domain::models::BdAddr;
use tracing::debug;

/// Hardware snapshot carried by a read-info reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub controller_type: u8,
    pub powered: bool,
    pub connectable: bool,
    pub discoverable: bool,
    pub pairable: bool,
    pub sec_mode: u8,
    pub address: BdAddr,
    pub class: [u8; 3],
    pub features: [u8; 8],
    pub manufacturer: u16,
    pub hci_ver: u8,
    pub hci_rev: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerInfo {
    pub valid: bool,
    /// Set once a read-info reply has populated the snapshot.
    pub info_read: bool,
    pub controller_type: u8,
    pub address: BdAddr,
    pub features: [u8; 8],
    pub class: [u8; 3],
    pub manufacturer: u16,
    pub hci_ver: u8,
    pub hci_rev: u16,
    pub enabled: bool,
    pub connectable: bool,
    pub discoverable: bool,
    pub pairable: bool,
    pub sec_mode: u8,
}

#[derive(Debug, Default)]
pub struct ControllerRegistry {
    slots: Vec<ControllerInfo>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or reset the slot for `index` and mark it valid. Growing the
    /// backing storage keeps every existing slot intact.
    pub fn add(&mut self, index: u16) {
        let slot = index as usize;
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, ControllerInfo::default());
        }

        self.slots[slot] = ControllerInfo {
            valid: true,
            ..ControllerInfo::default()
        };

        debug!("Added controller {}", index);
    }

    /// Invalidate `index`. Returns true if the slot was valid, in which case
    /// the owner must tear down the adapter bound to it.
    pub fn remove(&mut self, index: u16) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(info) if info.valid => {
                *info = ControllerInfo::default();
                debug!("Removed controller {}", index);
                true
            }
            _ => false,
        }
    }

    /// Replace the hardware snapshot of a valid slot.
    pub fn update_info(&mut self, index: u16, snapshot: &ControllerSnapshot) -> Result<()> {
        let info = self.valid_mut(index)?;
        info.info_read = true;
        info.controller_type = snapshot.controller_type;
        info.enabled = snapshot.powered;
        info.connectable = snapshot.connectable;
        info.discoverable = snapshot.discoverable;
        info.pairable = snapshot.pairable;
        info.sec_mode = snapshot.sec_mode;
        info.address = snapshot.address;
        info.class = snapshot.class;
        info.features = snapshot.features;
        info.manufacturer = snapshot.manufacturer;
        info.hci_ver = snapshot.hci_ver;
        info.hci_rev = snapshot.hci_rev;
        Ok(())
    }

    pub fn set_powered(&mut self, index: u16, powered: bool) -> Result<()> {
        self.valid_mut(index)?.enabled = powered;
        Ok(())
    }

    pub fn set_discoverable(&mut self, index: u16, discoverable: bool) -> Result<()> {
        self.valid_mut(index)?.discoverable = discoverable;
        Ok(())
    }

    pub fn set_connectable(&mut self, index: u16, connectable: bool) -> Result<()> {
        self.valid_mut(index)?.connectable = connectable;
        Ok(())
    }

    pub fn set_pairable(&mut self, index: u16, pairable: bool) -> Result<()> {
        self.valid_mut(index)?.pairable = pairable;
        Ok(())
    }

    pub fn set_class(&mut self, index: u16, class: [u8; 3]) -> Result<()> {
        self.valid_mut(index)?.class = class;
        Ok(())
    }

    pub fn get(&self, index: u16) -> Option<&ControllerInfo> {
        self.slots.get(index as usize).filter(|info| info.valid)
    }

    /// Like [`get`](Self::get) but fails with `NoSuchController`.
    pub fn require(&self, index: u16) -> Result<&ControllerInfo> {
        self.get(index).ok_or(Error::NoSuchController(index))
    }

    pub fn indices(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, info)| info.valid)
            .map(|(i, _)| i as u16)
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn valid_mut(&mut self, index: u16) -> Result<&mut ControllerInfo> {
        self.slots
            .get_mut(index as usize)
            .filter(|info| info.valid)
            .ok_or(Error::NoSuchController(index))
    }
}

//! Discovery working set: the found-device cache and inquiry state flags.

use crate::domain::models::{BdAddr, NameStatus, Properties, PropertyValue, RSSI_UNKNOWN};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryState {
    pub std_inquiry: bool,
    pub periodic_inquiry: bool,
    pub resolving_names: bool,
}

impl DiscoveryState {
    /// True while the radio is inquiring (either strategy).
    pub fn is_active(&self) -> bool {
        self.std_inquiry || self.periodic_inquiry
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeviceInfo {
    pub address: BdAddr,
    pub rssi: i8,
    pub class: u32,
    pub alias: Option<String>,
    pub name: Option<String>,
    pub name_status: NameStatus,
    /// Order of first sighting.
    seq: u64,
}

impl RemoteDeviceInfo {
    fn distance(&self) -> u8 {
        self.rssi.unsigned_abs()
    }

    fn sort_key(&self) -> (u8, u64) {
        (self.distance(), self.seq)
    }

    /// Property set published with a DeviceFound signal.
    pub fn properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert(
            "Address".to_string(),
            PropertyValue::Str(self.address.to_string()),
        );
        props.insert("Class".to_string(), PropertyValue::U32(self.class));
        props.insert("RSSI".to_string(), PropertyValue::I32(self.rssi as i32));

        if let Some(name) = &self.name {
            props.insert("Name".to_string(), PropertyValue::Str(name.clone()));
        }

        let alias = match (&self.alias, &self.name) {
            (Some(alias), _) => alias.clone(),
            (None, Some(name)) => name.clone(),
            (None, None) => self.address.to_string().replace(':', "-"),
        };
        props.insert("Alias".to_string(), PropertyValue::Str(alias));
        props
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// One sighting reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub address: BdAddr,
    pub rssi: i8,
    pub class: u32,
    pub alias: Option<String>,
    pub name: Option<String>,
    pub name_status: NameStatus,
}

/// Devices seen during the current discovery, kept sorted by signal-strength
/// distance (|rssi| ascending). Equal distances keep insertion order.
#[derive(Debug, Default)]
pub struct FoundDevices {
    entries: Vec<RemoteDeviceInfo>,
    next_seq: u64,
}

impl FoundDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, sighting: Sighting) -> Upsert {
        if let Some(dev) = self
            .entries
            .iter_mut()
            .find(|d| d.address == sighting.address)
        {
            if sighting.rssi != RSSI_UNKNOWN {
                dev.rssi = sighting.rssi;
            }
            dev.class = sighting.class;
            if sighting.alias.is_some() {
                dev.alias = sighting.alias;
            }
            if sighting.name.is_some() {
                dev.name = sighting.name;
            }
            dev.name_status = dev.name_status.escalate(sighting.name_status);

            self.entries.sort_by_key(RemoteDeviceInfo::sort_key);
            return Upsert::Updated;
        }

        let dev = RemoteDeviceInfo {
            address: sighting.address,
            rssi: sighting.rssi,
            class: sighting.class,
            alias: sighting.alias,
            name: sighting.name,
            name_status: sighting.name_status,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let at = self
            .entries
            .partition_point(|d| d.sort_key() <= dev.sort_key());
        self.entries.insert(at, dev);
        Upsert::Inserted
    }

    pub fn get(&self, address: &BdAddr) -> Option<&RemoteDeviceInfo> {
        self.entries.iter().find(|d| d.address == *address)
    }

    pub fn get_mut(&mut self, address: &BdAddr) -> Option<&mut RemoteDeviceInfo> {
        self.entries.iter_mut().find(|d| d.address == *address)
    }

    pub fn remove(&mut self, address: &BdAddr) -> Option<RemoteDeviceInfo> {
        let pos = self.entries.iter().position(|d| d.address == *address)?;
        Some(self.entries.remove(pos))
    }

    /// Mark a device as needing no further name resolution. Unlike
    /// sightings this is allowed to move the status down.
    pub fn name_resolved(&mut self, address: &BdAddr) -> bool {
        match self.get_mut(address) {
            Some(dev) => {
                dev.name_status = NameStatus::NotRequired;
                true
            }
            None => false,
        }
    }

    /// First device still waiting for a name request, in cache order.
    pub fn next_unresolved(&self) -> Option<BdAddr> {
        self.entries
            .iter()
            .find(|d| d.name_status == NameStatus::Any)
            .map(|d| d.address)
    }

    /// Device whose name request is currently outstanding.
    pub fn pending_request(&self) -> Option<BdAddr> {
        self.entries
            .iter()
            .find(|d| d.name_status == NameStatus::Requested)
            .map(|d| d.address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteDeviceInfo> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BdAddr {
        BdAddr([last, 0, 0, 0, 0x11, 0x00])
    }

    fn sighting(last: u8, rssi: i8, status: NameStatus) -> Sighting {
        Sighting {
            address: addr(last),
            rssi,
            class: 0x5a020c,
            alias: None,
            name: None,
            name_status: status,
        }
    }

    fn order(found: &FoundDevices) -> Vec<BdAddr> {
        found.iter().map(|d| d.address).collect()
    }

    #[test]
    fn test_repeat_sighting_updates_in_place_and_resorts() {
        let mut found = FoundDevices::new();
        found.upsert(sighting(1, -40, NameStatus::Any));
        found.upsert(sighting(2, -55, NameStatus::Any));

        assert_eq!(order(&found), vec![addr(1), addr(2)]);

        let result = found.upsert(sighting(1, -70, NameStatus::Any));
        assert_eq!(result, Upsert::Updated);
        assert_eq!(found.len(), 2);
        assert_eq!(found.get(&addr(1)).unwrap().rssi, -70);
        assert_eq!(order(&found), vec![addr(2), addr(1)]);
    }

    #[test]
    fn test_unknown_rssi_keeps_previous_sample() {
        let mut found = FoundDevices::new();
        found.upsert(sighting(1, -40, NameStatus::Any));
        found.upsert(sighting(1, RSSI_UNKNOWN, NameStatus::Any));
        assert_eq!(found.get(&addr(1)).unwrap().rssi, -40);
    }

    #[test]
    fn test_equal_distance_keeps_insertion_order() {
        let mut found = FoundDevices::new();
        found.upsert(sighting(1, -50, NameStatus::Any));
        found.upsert(sighting(2, 50, NameStatus::Any));
        found.upsert(sighting(3, -50, NameStatus::Any));
        assert_eq!(order(&found), vec![addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn test_update_keeps_first_sighting_order_on_ties() {
        let mut found = FoundDevices::new();
        found.upsert(sighting(1, -60, NameStatus::Any));
        found.upsert(sighting(2, -50, NameStatus::Any));
        assert_eq!(order(&found), vec![addr(2), addr(1)]);

        found.upsert(sighting(1, -50, NameStatus::Any));
        assert_eq!(order(&found), vec![addr(1), addr(2)]);

        found.upsert(sighting(2, -50, NameStatus::Any));
        assert_eq!(order(&found), vec![addr(1), addr(2)]);
    }

    #[test]
    fn test_name_status_escalates_only() {
        let mut found = FoundDevices::new();
        found.upsert(sighting(1, -40, NameStatus::Any));

        found.upsert(sighting(1, -40, NameStatus::NotRequired));
        assert_eq!(found.get(&addr(1)).unwrap().name_status, NameStatus::Any);

        found.upsert(sighting(1, -40, NameStatus::Requested));
        assert_eq!(found.get(&addr(1)).unwrap().name_status, NameStatus::Requested);

        found.upsert(sighting(1, -40, NameStatus::NotRequired));
        assert_eq!(found.get(&addr(1)).unwrap().name_status, NameStatus::Requested);
    }

    #[test]
    fn test_alias_replaced_only_when_supplied() {
        let mut found = FoundDevices::new();
        let mut first = sighting(1, -40, NameStatus::Any);
        first.alias = Some("Kitchen".to_string());
        found.upsert(first);
        found.upsert(sighting(1, -41, NameStatus::Any));
        assert_eq!(found.get(&addr(1)).unwrap().alias.as_deref(), Some("Kitchen"));

        let props = found.get(&addr(1)).unwrap().properties();
        assert_eq!(
            props.get("Alias"),
            Some(&PropertyValue::Str("Kitchen".to_string()))
        );
        assert_eq!(props.get("RSSI"), Some(&PropertyValue::I32(-41)));
    }

    #[test]
    fn test_resolution_queue_order() {
        let mut found = FoundDevices::new();
        found.upsert(sighting(1, -60, NameStatus::Any));
        found.upsert(sighting(2, -30, NameStatus::NotRequired));
        found.upsert(sighting(3, -45, NameStatus::Any));

        assert_eq!(found.next_unresolved(), Some(addr(3)));
        found.name_resolved(&addr(3));
        assert_eq!(found.next_unresolved(), Some(addr(1)));
        assert_eq!(found.pending_request(), None);
    }
}

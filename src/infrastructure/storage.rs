//! Per-controller key/value persistence.
//!
//! [`FileStore`] keeps one JSON object per controller address under the
//! configured storage directory. [`MemoryStore`] is used when persistence is
//! disabled.

use crate::domain::error::Result;
use crate::domain::models::BdAddr;
use crate::domain::ops::SettingsStore;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

type Entries = BTreeMap<String, String>;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_for(&self, controller: &BdAddr) -> PathBuf {
        self.root.join(controller.to_string()).join("settings.json")
    }

    fn load(&self, controller: &BdAddr) -> Entries {
        let path = self.file_for(controller);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Entries::new(),
        };

        match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring unreadable storage file {}: {}", path.display(), e);
                Entries::new()
            }
        }
    }

    fn save(&self, controller: &BdAddr, entries: &Entries) -> Result<()> {
        let path = self.file_for(controller);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries).map_err(std::io::Error::from)?;
        fs::write(&path, json)?;
        debug!("Saved {} entries to {}", entries.len(), path.display());
        Ok(())
    }
}

impl SettingsStore for FileStore {
    fn read(&self, controller: &BdAddr, key: &str) -> Option<String> {
        self.load(controller).remove(key)
    }

    fn write(&mut self, controller: &BdAddr, key: &str, value: &str) -> Result<()> {
        let mut entries = self.load(controller);
        entries.insert(key.to_string(), value.to_string());
        self.save(controller, &entries)
    }

    fn delete(&mut self, controller: &BdAddr, key: &str) -> Result<()> {
        let mut entries = self.load(controller);
        if entries.remove(key).is_some() {
            self.save(controller, &entries)?;
        }
        Ok(())
    }

    fn keys_with_prefix(&self, controller: &BdAddr, prefix: &str) -> Vec<String> {
        self.load(controller)
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<BdAddr, Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn read(&self, controller: &BdAddr, key: &str) -> Option<String> {
        self.entries.get(controller)?.get(key).cloned()
    }

    fn write(&mut self, controller: &BdAddr, key: &str, value: &str) -> Result<()> {
        self.entries
            .entry(*controller)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, controller: &BdAddr, key: &str) -> Result<()> {
        if let Some(entries) = self.entries.get_mut(controller) {
            entries.remove(key);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, controller: &BdAddr, prefix: &str) -> Vec<String> {
        self.entries
            .get(controller)
            .map(|entries| {
                entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

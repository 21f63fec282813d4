use crate::domain::models::Mode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "/var/log/btadapterd".to_string()
}
fn default_prefix() -> String {
    "btadapterd".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// How discovery drives the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InquiryStrategy {
    /// One bounded inquiry per round. A non-zero interval restarts inquiry
    /// that many seconds after each round while discovery is wanted.
    Standard { reinquiry_interval_secs: u32 },
    /// Hardware-repeated inquiry; periods are in units of 1.28 s.
    Periodic { min_period: u16, max_period: u16 },
}

impl Default for InquiryStrategy {
    fn default() -> Self {
        InquiryStrategy::Standard {
            reinquiry_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Mode applied to a controller the first time it is seen.
    #[serde(default = "default_mode")]
    pub default_mode: Mode,
    /// Restore the last persisted mode instead of `default_mode`.
    #[serde(default = "default_true")]
    pub remember_powered: bool,
    #[serde(default = "default_discoverable_timeout")]
    pub discoverable_timeout_secs: u32,
    #[serde(default)]
    pub pairable_timeout_secs: u32,
    #[serde(default)]
    pub inquiry: InquiryStrategy,
    /// Inquiry length in units of 1.28 s.
    #[serde(default = "default_inquiry_length")]
    pub inquiry_length: u8,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub device_class: u32,
    /// Major service class byte pushed once an adapter is initialised.
    #[serde(default)]
    pub service_class: u8,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default = "default_true")]
    pub persist_storage: bool,
    #[serde(default = "default_socket_name")]
    pub rpc_socket_name: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            remember_powered: default_true(),
            discoverable_timeout_secs: default_discoverable_timeout(),
            pairable_timeout_secs: 0,
            inquiry: InquiryStrategy::default(),
            inquiry_length: default_inquiry_length(),
            name: default_name(),
            device_class: 0,
            service_class: 0,
            storage_dir: default_storage_dir(),
            persist_storage: default_true(),
            rpc_socket_name: default_socket_name(),
        }
    }
}

fn default_mode() -> Mode {
    Mode::Connectable
}
fn default_discoverable_timeout() -> u32 {
    180
}
fn default_inquiry_length() -> u8 {
    8
}
fn default_name() -> String {
    "btadapterd".to_string()
}
fn default_storage_dir() -> String {
    "/var/lib/btadapterd".to_string()
}
fn default_socket_name() -> String {
    "btadapterd.sock".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub daemon: DaemonSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from `path`, or from the per-user config directory when
    /// no path is given. Missing files yield defaults.
    pub fn new(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = match path {
            Some(path) => path,
            None => Self::get_settings_path()?,
        };
        let settings = if settings_path.exists() {
            Self::load_from_file(&settings_path)?
        } else {
            Settings::default()
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("btadapterd");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "daemon": { "default_mode": "off" } }"#).unwrap();
        assert_eq!(settings.daemon.default_mode, Mode::Off);
        assert_eq!(settings.daemon.discoverable_timeout_secs, 180);
        assert_eq!(settings.log_settings.level, "info");
        assert_eq!(
            settings.daemon.inquiry,
            InquiryStrategy::Standard {
                reinquiry_interval_secs: 10
            }
        );
    }

    #[test]
    fn test_inquiry_strategy_tagging() {
        let strategy: InquiryStrategy =
            serde_json::from_str(r#"{ "kind": "periodic", "min_period": 16, "max_period": 24 }"#)
                .unwrap();
        assert_eq!(
            strategy,
            InquiryStrategy::Periodic {
                min_period: 16,
                max_period: 24
            }
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("btadapterd-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let service = SettingsService::new(Some(path.clone())).unwrap();
        service.save().unwrap();

        let reloaded = SettingsService::new(Some(path)).unwrap();
        assert_eq!(reloaded.get().daemon.name, "btadapterd");
        let _ = fs::remove_dir_all(dir);
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::infrastructure::bluetooth::protocol;

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
    "logs".to_string()
}
fn default_prefix() -> String {
    "bluetooth_car".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Policy of the core. Presentation preferences are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    /// Service record the car's serial receiver listens on
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,

    /// PINs tried automatically, in order, before asking the operator
    #[serde(default = "default_pins")]
    pub default_pins: Vec<String>,

    /// Cadence of continuous commands while a control is held
    #[serde(default = "default_repeat_interval_ms")]
    pub repeat_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            service_uuid: default_service_uuid(),
            default_pins: default_pins(),
            repeat_interval_ms: default_repeat_interval_ms(),
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERIAL_PORT_SERVICE_UUID.to_string()
}
fn default_pins() -> Vec<String> {
    vec!["1234".to_string(), "0000".to_string()]
}
fn default_repeat_interval_ms() -> u64 {
    protocol::REPEAT_INTERVAL_MS
}

impl Settings {
    /// Configured service id, falling back to the Serial Port Profile
    pub fn service_uuid(&self) -> Uuid {
        match Uuid::parse_str(&self.service_uuid) {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!(
                    "Invalid service uuid {:?} in settings ({}), using the serial port profile",
                    self.service_uuid, e
                );
                protocol::serial_port_service_uuid()
            }
        }
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_ms.max(1))
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, using defaults when the file is missing
    /// or unreadable
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!("Ignoring unreadable settings at {:?}: {}", settings_path, e);
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BluetoothCar");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"default_pins": ["9999"]}"#).unwrap();
        assert_eq!(settings.default_pins, vec!["9999".to_string()]);
        assert_eq!(settings.repeat_interval(), Duration::from_millis(100));
        assert_eq!(settings.service_uuid(), protocol::serial_port_service_uuid());
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_default_pin_order() {
        assert_eq!(Settings::default().default_pins, vec!["1234", "0000"]);
    }

    #[test]
    fn test_bad_uuid_uses_serial_port_profile() {
        let settings = Settings {
            service_uuid: "not-a-uuid".into(),
            ..Settings::default()
        };
        assert_eq!(settings.service_uuid(), protocol::serial_port_service_uuid());
    }

    #[test]
    fn test_save_then_load_from_path() {
        let path = std::env::temp_dir().join(format!(
            "bluetooth_car_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::load(path.clone());
        service.get_mut().default_pins = vec!["4321".into()];
        service.save().unwrap();

        let reloaded = SettingsService::load(path.clone());
        assert_eq!(reloaded.get().default_pins, vec!["4321".to_string()]);
        let _ = fs::remove_file(path);
    }
}

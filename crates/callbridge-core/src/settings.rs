use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::state::CallMode;

const SETTINGS_FILE: &str = "call_settings.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_mode")]
    pub default_mode: CallMode,
    /// Hang up sessions that have not connected after this many seconds.
    /// `None` waits forever.
    #[serde(default)]
    pub negotiation_timeout_secs: Option<u64>,
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_mode() -> CallMode {
    CallMode::Audio
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            default_mode: default_mode(),
            negotiation_timeout_secs: None,
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join(SETTINGS_FILE);
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub fn set_ice_servers(&self, servers: Vec<String>) {
        self.settings.lock().unwrap().ice_servers = servers;
        self.save();
    }

    pub fn set_default_mode(&self, mode: CallMode) {
        self.settings.lock().unwrap().default_mode = mode;
        self.save();
    }

    pub fn set_negotiation_timeout_secs(&self, secs: Option<u64>) {
        self.settings.lock().unwrap().negotiation_timeout_secs = secs;
        self.save();
    }

    fn save(&self) {
        let settings = self.settings.lock().unwrap().clone();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize settings: {e}"),
        }
    }

    fn load(path: &PathBuf) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: settings  -  persisted user preferences
//
//  Stored as TOML at `<config dir>/esp32-flasher/settings.toml`:
//
//      last_folder = "/home/me/builds/logger"
//      last_port   = "/dev/ttyUSB0"
//      esptool     = "/opt/esptool/esptool.py"   # optional override
//      cache_dir   = "/data/fw-cache"            # optional override
//
//      [flash]
//      baud       = 460800
//      flash_mode = "dio"
//      verify     = true
//
//      [cloud]
//      project_id  = "my-project"
//      api_key     = "AIza..."
//      collections = ["firmware_versions", "firmware"]
//      base_url    = "http://localhost:8080/v1"  # optional, e.g. an emulator
//
//  A missing file means defaults. ESP32_FLASHER_API_KEY and
//  ESP32_FLASHER_PROJECT override the [cloud] credentials.
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::esptool::FlashParams;
use crate::metadata::DEFAULT_COLLECTIONS;

pub const ENV_API_KEY: &str = "ESP32_FLASHER_API_KEY";
pub const ENV_PROJECT: &str = "ESP32_FLASHER_PROJECT";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Most recently flashed local folder.
    pub last_folder: Option<PathBuf>,
    pub last_port:   Option<String>,
    pub esptool:     Option<PathBuf>,
    pub cache_dir:   Option<PathBuf>,
    pub flash:       FlashParams,
    pub cloud:       CloudSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub project_id:  Option<String>,
    pub api_key:     Option<String>,
    pub collections: Vec<String>,
    /// Firestore REST root; the public endpoint when unset.
    pub base_url:    Option<String>,
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            project_id:  None,
            api_key:     None,
            collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            base_url:    None,
        }
    }
}

impl CloudSettings {
    /// `(project_id, api_key)`, or MissingCredentials naming what is absent.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        let project = self.project_id.as_deref().filter(|s| !s.is_empty());
        let key = self.api_key.as_deref().filter(|s| !s.is_empty());
        match (project, key) {
            (Some(p), Some(k)) => Ok((p, k)),
            (None, _) => Err(FlashError::MissingCredentials("project id".into())),
            (_, None) => Err(FlashError::MissingCredentials("API key".into())),
        }
    }
}

impl Settings {
    /// Apply environment overrides from a lookup function.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(k) = get(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.cloud.api_key = Some(k);
        }
        if let Some(p) = get(ENV_PROJECT).filter(|v| !v.is_empty()) {
            self.cloud.project_id = Some(p);
        }
    }

    /// Remember a folder only when it actually holds an application image.
    pub fn remember_folder(&mut self, dir: &Path) -> bool {
        if dir.join(crate::firmware::APP_FILE).is_file() {
            self.last_folder = Some(dir.to_path_buf());
            true
        } else {
            false
        }
    }

    /// Last folder, if it still exists.
    pub fn last_folder(&self) -> Option<&Path> {
        self.last_folder.as_deref().filter(|p| p.is_dir())
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SettingsStore { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("esp32-flasher")
            .join("settings.toml")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file. Absent file yields defaults; a malformed one is an error.
    pub fn load(&self) -> Result<Settings> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("settings: {} not found, using defaults", self.path.display());
                return Ok(Settings::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&raw).map_err(|e| FlashError::InvalidSettings {
            path:   self.path.clone(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(settings).map_err(|e| FlashError::InvalidSettings {
            path:   self.path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&self.path, raw)?;
        debug!("settings: saved {}", self.path.display());
        Ok(())
    }
}

//! Configuration file format.
//!
//! ```toml
//! [logging]
//! log_dir = "/var/log/dvb-input"
//! retention_days = 14
//! level = "debug"
//!
//! [settings]
//! dir = "/var/lib/dvb-input"
//!
//! [[frontend]]
//! adapter = 0
//! number = 0
//! type = "DVB-T"
//! name = "Terrestrial"
//! network = "5c1d9b4e0a7f4c3e9d2b8a6f1e0c7d3a"
//! autostart = "0b6f5e4d3c2b1a09f8e7d6c5b4a39281"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use dvb_protocol::{ConfigMap, FrontendType};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::device::FrontendPaths;

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "dvb-input.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub settings: SettingsSection,
    #[serde(default, rename = "frontend")]
    pub frontends: Vec<FrontendSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SettingsSection {
    pub dir: Option<String>,
}

/// One `[[frontend]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct FrontendSection {
    pub adapter: u32,
    #[serde(default)]
    pub number: u32,
    #[serde(rename = "type")]
    pub kind: FrontendType,
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub fullmux: Option<bool>,
    pub network: Option<String>,
    /// Mux to tune once the frontend is set up.
    pub autostart: Option<String>,
}

impl FrontendSection {
    pub fn paths(&self) -> FrontendPaths {
        FrontendPaths::for_adapter(self.adapter, self.number)
    }

    /// The settings this entry overrides, in persisted form.
    pub fn to_update(&self) -> ConfigMap {
        let mut conf = ConfigMap::new();
        if let Some(name) = &self.name {
            conf.insert("displayname".into(), Value::from(name.as_str()));
        }
        if let Some(enabled) = self.enabled {
            conf.insert("enabled".into(), Value::from(enabled));
        }
        if let Some(fullmux) = self.fullmux {
            conf.insert("fullmux".into(), Value::from(fullmux));
        }
        if let Some(network) = &self.network {
            conf.insert("networks".into(), Value::from(network.as_str()));
        }
        conf
    }
}

pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

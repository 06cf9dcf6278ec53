//! Persisted entity configuration.
//!
//! Entities are stored as JSON objects under slash separated keys:
//!
//! ```text
//! input/linuxdvb/networks/<network>/config
//! input/linuxdvb/networks/<network>/muxes/<mux>/config
//! input/linuxdvb/networks/<network>/muxes/<mux>/services/<service>
//! input/linuxdvb/frontends/<frontend>
//! ```
//!
//! Removing a key removes everything below it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use dvb_protocol::ConfigMap;
use log::{debug, trace};
use parking_lot::Mutex;
use thiserror::Error;

pub const NETWORKS_ROOT: &str = "input/linuxdvb/networks";
pub const FRONTENDS_ROOT: &str = "input/linuxdvb/frontends";

/// Settings store error types.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings key: {0:?}")]
    InvalidKey(String),

    #[error("Settings entry {0} is not an object")]
    NotAnObject(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

pub fn network_key(network: &str) -> String {
    format!("{}/{}", NETWORKS_ROOT, network)
}

pub fn mux_key(network: &str, mux: &str) -> String {
    format!("{}/{}/muxes/{}", NETWORKS_ROOT, network, mux)
}

pub fn service_key(network: &str, mux: &str, service: &str) -> String {
    format!("{}/services/{}", mux_key(network, mux), service)
}

pub fn frontend_key(frontend: &str) -> String {
    format!("{}/{}", FRONTENDS_ROOT, frontend)
}

/// Hierarchical key/value store for entity configuration.
pub trait SettingsStore: Send + Sync {
    fn save(&self, key: &str, conf: &ConfigMap) -> Result<()>;

    fn load(&self, key: &str) -> Result<Option<ConfigMap>>;

    /// Names of the direct children of `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove `prefix` and everything below it.
    fn remove(&self, prefix: &str) -> Result<()>;
}

fn check_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if bad {
        return Err(SettingsError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemorySettings {
    entries: Mutex<BTreeMap<String, ConfigMap>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SettingsStore for MemorySettings {
    fn save(&self, key: &str, conf: &ConfigMap) -> Result<()> {
        check_key(key)?;
        self.entries.lock().insert(key.to_string(), conf.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<ConfigMap>> {
        check_key(key)?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        check_key(prefix)?;
        let dir = format!("{}/", prefix);
        let mut names: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&dir))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        names.dedup();
        Ok(names)
    }

    fn remove(&self, prefix: &str) -> Result<()> {
        check_key(prefix)?;
        let dir = format!("{}/", prefix);
        self.entries
            .lock()
            .retain(|k, _| k != prefix && !k.starts_with(&dir));
        Ok(())
    }
}

/// One pretty-printed JSON file per key below a root directory.
#[derive(Debug, Clone)]
pub struct JsonSettings {
    root: PathBuf,
}

impl JsonSettings {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!("Settings directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

impl SettingsStore for JsonSettings {
    fn save(&self, key: &str, conf: &ConfigMap) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(conf)?)?;
        fs::rename(&tmp, &path)?;
        trace!("Saved settings {}", key);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<ConfigMap>> {
        let path = self.path(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        match serde_json::from_slice(&data)? {
            serde_json::Value::Object(map) => Ok(Some(map)),
            _ => Err(SettingsError::NotAnObject(key.to_string())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = self.path(prefix)?;
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, prefix: &str) -> Result<()> {
        let path = self.path(prefix)?;
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                debug!("Removed settings {}", prefix);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

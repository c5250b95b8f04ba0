//! Persistence of catalogs and configuration.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub trait Store<T>: Send + Sync {
    fn load(&self) -> anyhow::Result<T>;
    fn store(&self, value: &T) -> anyhow::Result<()>;
}

/// A JSON document on disk.
///
/// Before every write the previous document is copied to a backup file,
/// which `load` falls back to when the primary file is missing or corrupt.
pub struct JsonFileStore<T> {
    path: PathBuf,
    backup_path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> JsonFileStore<T> {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(".bak");
        JsonFileStore {
            path,
            backup_path: PathBuf::from(backup),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("config file {} could not be accessed", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON format of config file {}", path.display()))
}

impl<T: Serialize + DeserializeOwned> Store<T> for JsonFileStore<T> {
    fn load(&self) -> anyhow::Result<T> {
        match read_json(&self.path) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("{:#}, trying backup {}", e, self.backup_path.display());
                read_json(&self.backup_path)
            }
        }
    }

    fn store(&self, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path).with_context(|| {
                format!("backup of config file {} couldn't be created", self.path.display())
            })?;
        }
        let text = serde_json::to_string_pretty(value)?;
        // Write next to the target and rename, so a crash never leaves half a document.
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        fs::write(&staging, text)?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("config file {} could not be written", self.path.display()))?;
        Ok(())
    }
}

/// Keeps the value in memory only.
pub struct MemoryStore<T> {
    value: Mutex<Option<T>>,
}

impl<T> MemoryStore<T> {
    pub fn new(initial: Option<T>) -> MemoryStore<T> {
        MemoryStore {
            value: Mutex::new(initial),
        }
    }
}

impl<T: Clone + Send> Store<T> for MemoryStore<T> {
    fn load(&self) -> anyhow::Result<T> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("nothing stored yet")
    }

    fn store(&self, value: &T) -> anyhow::Result<()> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        Ok(())
    }
}

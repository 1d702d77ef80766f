use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-loadpoint state that survives a restart: a scheduled target charge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(rename = "targetSoc", default, skip_serializing_if = "Option::is_none")]
    pub target_soc: Option<u32>,
    #[serde(rename = "finishAt", default, skip_serializing_if = "Option::is_none")]
    pub finish_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsData {
    #[serde(default)]
    loadpoints: BTreeMap<usize, RuntimeSettings>,
}

/// Small JSON-file persistence for runtime settings. Constructed once at
/// startup and passed explicitly to the loadpoints that use it.
pub struct SettingsStore {
    path: PathBuf,
    data: Mutex<SettingsData>,
}

impl SettingsStore {
    /// Load the store, starting empty when the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse runtime settings {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsData::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("read runtime settings {}", path.display()))
            }
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn get(&self, loadpoint: usize) -> RuntimeSettings {
        self.data
            .lock()
            .loadpoints
            .get(&loadpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, loadpoint: usize, settings: RuntimeSettings) -> Result<()> {
        let bytes = {
            let mut data = self.data.lock();
            data.loadpoints.insert(loadpoint, settings);
            serde_json::to_vec_pretty(&*data)?
        };

        std::fs::write(&self.path, bytes)
            .with_context(|| format!("write runtime settings {}", self.path.display()))?;
        debug!(loadpoint, path = %self.path.display(), "runtime settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("runtime.json")).unwrap();
        assert_eq!(store.get(0), RuntimeSettings::default());
    }

    #[test]
    fn settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");

        let finish = DateTime::parse_from_rfc3339("2024-06-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        {
            let store = SettingsStore::load(&path).unwrap();
            store
                .set(
                    1,
                    RuntimeSettings {
                        target_soc: Some(80),
                        finish_at: Some(finish),
                    },
                )
                .unwrap();
        }

        let store = SettingsStore::load(&path).unwrap();
        let settings = store.get(1);
        assert_eq!(settings.target_soc, Some(80));
        assert_eq!(settings.finish_at, Some(finish));
        assert_eq!(store.get(2), RuntimeSettings::default());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(SettingsStore::load(&path).is_err());
    }
}

//! Persisted UI preferences.
//!
//! Stored as a flat JSON object under fixed keys. The values are advisory:
//! a missing file, an unreadable file, or a single bad value falls back to
//! defaults and never fails a load.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const VIEW_MODE_KEY: &str = "curio.viewMode";
pub const ACTIVE_FILTER_KEY: &str = "curio.activeFilterId";
pub const SCROLL_OFFSET_KEY: &str = "curio.scrollOffset";

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("prefs I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("prefs encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How listings are laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Table,
    Grid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiPrefs {
    pub view_mode: ViewMode,
    pub active_filter_id: Option<String>,
    pub scroll_offset: u64,
}

/// File-backed key/value store for [`UiPrefs`].
#[derive(Debug, Clone)]
pub struct PrefsStore {
    path: PathBuf,
}

impl PrefsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$XDG_CONFIG_HOME/curio/prefs.json`, falling back to `~/.config`.
    pub fn default_path() -> PathBuf {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("curio").join("prefs.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_object(&self) -> Map<String, Value> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no prefs file");
                return Map::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read prefs, using defaults");
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(path = %self.path.display(), "prefs file is not an object, using defaults");
                Map::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt prefs file, using defaults");
                Map::new()
            }
        }
    }

    /// Load prefs. Never fails.
    pub fn load(&self) -> UiPrefs {
        let map = self.read_object();
        let defaults = UiPrefs::default();
        UiPrefs {
            view_mode: read_key(&map, VIEW_MODE_KEY).unwrap_or(defaults.view_mode),
            active_filter_id: read_key(&map, ACTIVE_FILTER_KEY).unwrap_or(defaults.active_filter_id),
            scroll_offset: read_key(&map, SCROLL_OFFSET_KEY).unwrap_or(defaults.scroll_offset),
        }
    }

    /// Write prefs, keeping any unrelated keys already in the file.
    pub fn save(&self, prefs: &UiPrefs) -> Result<(), PrefsError> {
        let mut map = self.read_object();
        map.insert(VIEW_MODE_KEY.to_string(), serde_json::to_value(prefs.view_mode)?);
        map.insert(
            ACTIVE_FILTER_KEY.to_string(),
            serde_json::to_value(&prefs.active_filter_id)?,
        );
        map.insert(SCROLL_OFFSET_KEY.to_string(), Value::from(prefs.scroll_offset));

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&Value::Object(map))?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn read_key<T: DeserializeOwned>(map: &Map<String, Value>, key: &str) -> Option<T> {
    let value = map.get(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key, error = %e, "ignoring invalid pref value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let store = PrefsStore::new(dir.path().join("prefs.json"));
        assert_eq!(store.load(), UiPrefs::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = PrefsStore::new(dir.path().join("nested").join("prefs.json"));
        let prefs = UiPrefs {
            view_mode: ViewMode::Grid,
            active_filter_id: Some("failed-jobs".to_string()),
            scroll_offset: 480,
        };
        store.save(&prefs).unwrap();
        assert_eq!(store.load(), prefs);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(PrefsStore::new(&path).load(), UiPrefs::default());
    }

    #[test]
    fn test_bad_value_only_resets_that_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(
            &path,
            r#"{"curio.viewMode": "carousel", "curio.scrollOffset": 120, "other.key": true}"#,
        )
        .unwrap();
        let store = PrefsStore::new(&path);
        let prefs = store.load();
        assert_eq!(prefs.view_mode, ViewMode::Table);
        assert_eq!(prefs.scroll_offset, 120);

        store.save(&prefs).unwrap();
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["other.key"], Value::Bool(true));
        assert_eq!(raw[VIEW_MODE_KEY], Value::from("table"));
    }
}

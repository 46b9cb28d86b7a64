//! Durable "an agent was activated here before" marker.
//!
//! The environment reports `installed` for a fresh install and for an update
//! alike; only this marker tells them apart across page loads.

use hashbrown::HashMap;
use offlinekit_common::{OfflineKitError, Result, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;
use url::Url;

/// Key-value store for boolean markers, scoped to one page origin.
pub trait MarkerStore: Send + Sync {
    /// Read a marker. Missing markers read as `false`.
    fn get(&self, key: &str) -> Result<bool>;

    /// Write a marker.
    fn set(&self, key: &str, value: bool) -> Result<()>;
}

/// Markers kept for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    values: Mutex<HashMap<String, bool>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with one marker already written.
    pub fn with_marker(key: &str, value: bool) -> Self {
        let store = Self::new();
        if let Ok(mut values) = store.values.lock() {
            values.insert(key.to_string(), value);
        }
        store
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn get(&self, key: &str) -> Result<bool> {
        let values = self
            .values
            .lock()
            .map_err(|_| OfflineKitError::internal("marker store lock poisoned"))?;
        Ok(values.get(key).copied().unwrap_or(false))
    }

    fn set(&self, key: &str, value: bool) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| OfflineKitError::internal("marker store lock poisoned"))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// On-disk layout: origin -> key -> value.
type MarkerFile = BTreeMap<String, BTreeMap<String, bool>>;

/// Markers persisted in a JSON file shared by all origins.
///
/// ```json
/// { "https://app.example": { "offlinekit.sw.activated": true } }
/// ```
#[derive(Debug)]
pub struct JsonFileMarkerStore {
    path: PathBuf,
    origin: String,
    write_lock: Mutex<()>,
}

impl JsonFileMarkerStore {
    /// Open the store at `path` for the origin of `page`.
    ///
    /// The file is created on first write.
    pub fn open(path: impl Into<PathBuf>, page: &Url) -> Self {
        Self {
            path: path.into(),
            origin: page.origin().ascii_serialization(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<MarkerFile> {
        if !self.path.exists() {
            return Ok(MarkerFile::new());
        }
        let raw = fs::read_to_string(&self.path)
            .storage_context(format!("reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(MarkerFile::new());
        }
        serde_json::from_str(&raw).storage_context(format!("parsing {}", self.path.display()))
    }

    /// Write through a temp file in the same directory, then rename it over
    /// the old file. Readers see either the old markers or the new ones.
    fn save(&self, markers: &MarkerFile) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).storage_context(format!("creating {}", dir.display()))?;

        let raw = serde_json::to_string_pretty(markers)
            .storage_context("serializing markers")?;
        let mut tmp = NamedTempFile::new_in(dir)
            .storage_context(format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(raw.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .storage_context(format!("writing {}", tmp.path().display()))?;
        tmp.persist(&self.path)
            .storage_context(format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl MarkerStore for JsonFileMarkerStore {
    fn get(&self, key: &str) -> Result<bool> {
        let markers = self.load()?;
        Ok(markers
            .get(&self.origin)
            .and_then(|values| values.get(key))
            .copied()
            .unwrap_or(false))
    }

    fn set(&self, key: &str, value: bool) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| OfflineKitError::internal("marker file lock poisoned"))?;
        let mut markers = self.load()?;
        markers
            .entry(self.origin.clone())
            .or_default()
            .insert(key.to_string(), value);
        self.save(&markers)?;
        debug!(origin = %self.origin, key, value, path = %self.path.display(), "Marker written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "offlinekit.sw.activated";

    fn page(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn test_memory_store_defaults_to_false() {
        let store = MemoryMarkerStore::new();
        assert!(!store.get(KEY).unwrap());

        store.set(KEY, true).unwrap();
        assert!(store.get(KEY).unwrap());
    }

    #[test]
    fn test_memory_store_with_marker() {
        let store = MemoryMarkerStore::with_marker(KEY, true);
        assert!(store.get(KEY).unwrap());
        assert!(!store.get("other").unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("markers.json");

        let store = JsonFileMarkerStore::open(&path, &page("https://app.example/"));
        assert!(!store.get(KEY).unwrap());
        store.set(KEY, true).unwrap();

        let reopened = JsonFileMarkerStore::open(&path, &page("https://app.example/play"));
        assert!(reopened.get(KEY).unwrap());
    }

    #[test]
    fn test_file_store_is_scoped_by_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");

        JsonFileMarkerStore::open(&path, &page("https://app.example/"))
            .set(KEY, true)
            .unwrap();

        let other = JsonFileMarkerStore::open(&path, &page("https://other.example/"));
        assert!(!other.get(KEY).unwrap());

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("https://app.example"));
    }

    #[test]
    fn test_file_store_replaces_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        let store = JsonFileMarkerStore::open(&path, &page("https://app.example/"));

        store.set(KEY, true).unwrap();
        store.set("other", false).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("markers.json")]);

        let parsed: MarkerFile = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["https://app.example"][KEY], true);
        assert_eq!(parsed["https://app.example"]["other"], false);
    }

    #[test]
    fn test_file_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonFileMarkerStore::open(&path, &page("https://app.example/"));
        let err = store.get(KEY).unwrap_err();
        assert_eq!(err.category(), "storage");
    }
}

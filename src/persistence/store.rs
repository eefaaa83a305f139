//! JSON instance store - Durable, cached, whole-document persistence

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::core::{AppInstance, InstanceId};
use crate::error::{InstanceError, Result};

/// Owns every instance record. The document is always read and written whole;
/// writes go to a sibling temp file that is renamed over the original.
pub struct InstanceStore {
    path: PathBuf,
    /// Cached copy of the full record set; `None` forces a disk read
    cache: Mutex<Option<Vec<AppInstance>>>,
}

impl InstanceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Vec<AppInstance>>>> {
        self.cache
            .lock()
            .map_err(|e| InstanceError::Environment(format!("Store lock poisoned: {}", e)))
    }

    /// All records; a missing file is an empty set
    pub fn load(&self) -> Result<Vec<AppInstance>> {
        let mut cache = self.lock()?;
        self.load_locked(&mut cache)
    }

    fn load_locked(&self, cache: &mut Option<Vec<AppInstance>>) -> Result<Vec<AppInstance>> {
        if let Some(instances) = cache.as_ref() {
            return Ok(instances.clone());
        }

        let instances: Vec<AppInstance> = match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                InstanceError::Format(format!("{} is corrupt: {}", self.path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded {} instances from {:?}", instances.len(), self.path);
        *cache = Some(instances.clone());
        Ok(instances)
    }

    /// Replace the whole record set
    pub fn save(&self, instances: &[AppInstance]) -> Result<()> {
        let mut cache = self.lock()?;
        self.save_locked(&mut cache, instances.to_vec())
    }

    fn save_locked(
        &self,
        cache: &mut Option<Vec<AppInstance>>,
        instances: Vec<AppInstance>,
    ) -> Result<()> {
        // Round-trip through Value so object keys come out sorted
        let value = serde_json::to_value(&instances)?;
        let json = serde_json::to_string_pretty(&value)?;
        write_atomic(&self.path, json.as_bytes())?;

        debug!("Saved {} instances to {:?}", instances.len(), self.path);
        *cache = Some(instances);
        Ok(())
    }

    pub fn get(&self, id: InstanceId) -> Result<AppInstance> {
        self.load()?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| InstanceError::NotFound(format!("Instance {} not found", id)))
    }

    pub fn add(&self, instance: AppInstance) -> Result<()> {
        let mut cache = self.lock()?;
        let mut instances = self.load_locked(&mut cache)?;
        info!("Adding instance {} ({})", instance.id, instance.name);
        instances.push(instance);
        self.save_locked(&mut cache, instances)
    }

    pub fn update(&self, instance: AppInstance) -> Result<()> {
        let mut cache = self.lock()?;
        let mut instances = self.load_locked(&mut cache)?;
        let slot = instances
            .iter_mut()
            .find(|i| i.id == instance.id)
            .ok_or_else(|| {
                InstanceError::NotFound(format!("Instance {} not found", instance.id))
            })?;
        *slot = instance;
        self.save_locked(&mut cache, instances)
    }

    /// Load, modify one record in place, save. Returns the updated record.
    pub fn modify(
        &self,
        id: InstanceId,
        f: impl FnOnce(&mut AppInstance),
    ) -> Result<AppInstance> {
        let mut cache = self.lock()?;
        let mut instances = self.load_locked(&mut cache)?;
        let slot = instances
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| InstanceError::NotFound(format!("Instance {} not found", id)))?;
        f(slot);
        let updated = slot.clone();
        self.save_locked(&mut cache, instances)?;
        Ok(updated)
    }

    pub fn delete(&self, id: InstanceId) -> Result<()> {
        let mut cache = self.lock()?;
        let mut instances = self.load_locked(&mut cache)?;
        let before = instances.len();
        instances.retain(|i| i.id != id);
        if instances.len() == before {
            return Err(InstanceError::NotFound(format!("Instance {} not found", id)));
        }
        info!("Deleting instance {}", id);
        self.save_locked(&mut cache, instances)
    }

    /// Force the next load to read from disk
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }
}

/// Write `bytes` to a temp file next to `path`, then rename it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| InstanceError::environment("Failed to create directory", parent, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("instances.json");
    let temp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AppType, Application};
    use tempfile::TempDir;

    fn record(name: &str) -> AppInstance {
        let app = Application {
            bundle_id: "com.example.app".into(),
            name: "App".into(),
            bundle_path: PathBuf::from("/Applications/App.app"),
            executable_path: PathBuf::from("/Applications/App.app/Contents/MacOS/App"),
            version: None,
            icon_file: None,
            is_sandboxed: false,
            app_type: AppType::Generic,
        };
        AppInstance::new(
            name,
            &app,
            Path::new("/data"),
            PathBuf::from(format!("/shims/{}.app", name)),
            Default::default(),
        )
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path().join("instances.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_add_update_delete_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.json");
        let store = InstanceStore::new(&path);

        let mut work = record("Work");
        store.add(work.clone()).unwrap();
        store.add(record("Home")).unwrap();

        work.notes = "daily driver".into();
        store.update(work.clone()).unwrap();

        let reopened = InstanceStore::new(&path);
        let loaded = reopened.get(work.id).unwrap();
        assert_eq!(loaded, work);
        assert_eq!(reopened.load().unwrap().len(), 2);

        reopened.delete(work.id).unwrap();
        assert!(reopened.get(work.id).unwrap_err().is_not_found());
        assert_eq!(reopened.load().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path().join("instances.json"));
        let ghost = record("Ghost");
        assert!(store.update(ghost.clone()).unwrap_err().is_not_found());
        assert!(store.delete(ghost.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_cache_until_invalidated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.json");
        let store = InstanceStore::new(&path);
        store.add(record("Work")).unwrap();

        // Another writer replaces the document behind the cache
        InstanceStore::new(&path).save(&[]).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);

        store.invalidate_cache();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_document_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.json");
        let store = InstanceStore::new(&path);
        store.add(record("Work")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value.is_array());
        assert!(text.contains("\n  {"));
        let keys: Vec<&String> = value[0].as_object().unwrap().keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(text.find("\"arguments\"").unwrap() < text.find("\"createdAt\"").unwrap());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_document_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instances.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = InstanceStore::new(&path).load().unwrap_err();
        assert!(matches!(err, InstanceError::Format(_)));
    }
}

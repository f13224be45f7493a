use crate::error::{DispatchError, Result};
use crate::registry::Registry;
use std::path::{Path, PathBuf};

const REGISTRY_FILE: &str = "webhooks.json";

/// Persists registrations and subscriptions under the extension data dir.
/// The dispatch log is never written to disk.
pub struct RegistryStore {
    data_dir: PathBuf,
}

impl RegistryStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<Registry>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DispatchError::Store(format!("failed to read {REGISTRY_FILE}: {e}")))?;
        let registry: Registry = serde_json::from_str(&content)
            .map_err(|e| DispatchError::Store(format!("failed to parse {REGISTRY_FILE}: {e}")))?;
        Ok(Some(registry))
    }

    /// Write via a temp file so a crash never leaves a truncated registry.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| DispatchError::Store(format!("failed to create data dir: {e}")))?;
        let content = serde_json::to_string_pretty(registry)
            .map_err(|e| DispatchError::Store(format!("failed to serialize webhooks: {e}")))?;
        let tmp = self.data_dir.join(format!("{REGISTRY_FILE}.tmp"));
        std::fs::write(&tmp, content)
            .map_err(|e| DispatchError::Store(format!("failed to write {REGISTRY_FILE}: {e}")))?;
        std::fs::rename(&tmp, self.path())
            .map_err(|e| DispatchError::Store(format!("failed to replace {REGISTRY_FILE}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::types::WebhookConfig;

    fn sample() -> Registry {
        let mut registry = Registry::new();
        let webhook = WebhookConfig {
            secret: Some("s3cret".into()),
            ..WebhookConfig::new("w1", "https://x.test/hook")
        }
        .resolve(&DispatcherConfig::default())
        .unwrap();
        registry.insert(webhook);
        registry.subscribe("w1", &["deal.created", "deal.won"]).unwrap();
        registry
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().to_path_buf());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("nested"));
        let registry = sample();

        store.save(&registry).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded, registry);
        assert_eq!(loaded.get("w1").unwrap().secret.as_deref(), Some("s3cret"));
        assert!(!dir.path().join("nested").join("webhooks.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("webhooks.json"), "{ not json").unwrap();
        let store = RegistryStore::new(dir.path().to_path_buf());
        assert!(matches!(store.load(), Err(DispatchError::Store(_))));
    }
}

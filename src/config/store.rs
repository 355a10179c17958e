use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads; a missing file is not an error and
/// yields the defaults.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load the configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No config file at {}, using defaults",
                    path.display()
                );
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Current configuration snapshot
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Apply a mutation, persist it, and swap the cache.
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        mutate(&mut config);
        self.save(&config).await?;
        self.cache.store(Arc::new(config));
        Ok(())
    }

    async fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = toml::to_string_pretty(config)
            .map_err(|e| AppError::Config(format!("failed to serialize config: {}", e)))?;
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(&dir.path().join("config.toml")).await.unwrap();
        assert_eq!(*store.get(), AppConfig::default());
    }

    #[tokio::test]
    async fn test_loads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            "[serial]\ndevice = \"/dev/ttyACM1\"\n\n[control]\nsensor_max = 4095\n",
        )
        .await
        .unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        let config = store.get();
        assert_eq!(config.serial.device, "/dev/ttyACM1");
        assert_eq!(config.control.sensor_max, 4095);
    }

    #[tokio::test]
    async fn test_malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "serial = 42\n").await.unwrap();

        let err = ConfigStore::load(&path).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_update_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let store = ConfigStore::load(&path).await.unwrap();
        store
            .update(|config| config.control.epsilon = 0.01)
            .await
            .unwrap();
        assert_eq!(store.get().control.epsilon, 0.01);

        let reloaded = ConfigStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get().control.epsilon, 0.01);
    }
}

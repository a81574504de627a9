use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, so hot paths (capture loops, preview
/// pacing) can consult configuration without contention. The file path
/// defaults to `CONFIG_PATH` and is created with defaults when missing.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Load (or create) the configuration file at `path`.
    ///
    /// Environment overrides are applied after the file is read, so the
    /// cached view is the final word for the rest of the process.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::write_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env_overrides();

        let cache = Arc::new(ArcSwap::from_pointee(config));
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            change_tx,
        })
    }

    async fn write_file(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Update configuration with a closure and persist it.
    ///
    /// Read-modify-write; configuration changes are infrequent and
    /// operator-initiated, last write wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        Self::write_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::spec::CameraSpec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_creates_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("camgrid.json");

        let store = ConfigStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.get().stream.target_fps, 15);
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("camgrid.json");

        let store = ConfigStore::open(&path).await.unwrap();
        store
            .update(|c| {
                c.web.http_port = 9000;
                c.cameras.push(CameraSpec {
                    id: "lobby".to_string(),
                    mode: None,
                    uri: "rtsp://10.0.0.5/stream".to_string(),
                    transport_preference: Default::default(),
                    resolution: Default::default(),
                    ready_frames: 1,
                    ready_duration_ms: 0,
                    ready_timeout_ms: 15_000,
                    backend_priority: vec![crate::camera::spec::BackendKind::Ffmpeg],
                    extra_decoder_flags: String::new(),
                    profile_name: None,
                    show: false,
                    enabled: true,
                });
            })
            .await
            .unwrap();

        // New store instance reads back the persisted state
        let store2 = ConfigStore::open(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].id, "lobby");
    }

    #[tokio::test]
    async fn test_change_notification() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("c.json")).await.unwrap();
        let mut rx = store.subscribe();
        store.update(|_| {}).await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "app_config");
    }

    #[tokio::test]
    async fn test_bad_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(ConfigStore::open(&path).await.is_err());
    }
}

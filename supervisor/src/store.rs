//! Persistence of the definition file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::definition::ConfigSnapshot;
use crate::error::StoreError;

/// Where service definitions live between sessions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Last modification time, or `None` when nothing has been persisted yet.
    async fn modified(&self) -> Result<Option<SystemTime>, StoreError>;

    /// Load the snapshot. A missing file yields the default, empty configuration.
    async fn load(&self) -> Result<ConfigSnapshot, StoreError>;

    /// Replace the persisted snapshot.
    async fn save(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError>;
}

/// A pretty-printed JSON file, replaced atomically on save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl DefinitionStore for JsonFileStore {
    async fn modified(&self) -> Result<Option<SystemTime>, StoreError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.modified().map(Some).map_err(|e| self.io_error(e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn load(&self) -> Result<ConfigSnapshot, StoreError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ConfigSnapshot::default()),
            Err(e) => return Err(self.io_error(e)),
        };

        serde_json::from_slice(&contents).map_err(|source| StoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    async fn save(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError> {
        let mut contents =
            serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;
        contents.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        // Readers never observe a half-written file.
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, &contents)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

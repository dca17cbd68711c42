//! Persistent instance identity.
//!
//! An instance keeps the same `InstanceId` across restarts. The id lives in one small
//! file; when it cannot be read a fresh id is generated and written durably before use.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tracing::info;
use tracing::warn;

use elwire::InstanceId;

use crate::error::ClusterError;
use crate::error::Result;

/// Storage for the single persisted `InstanceId` value.
pub trait InstanceIdStore: Send + Sync {
    fn read(&self) -> Result<InstanceId>;
    fn write(&self, id: InstanceId) -> Result<()>;
}

/// Keeps the id as text in one file.
#[derive(Debug, Clone)]
pub struct FileInstanceIdStore {
    path: PathBuf,
}

impl FileInstanceIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "instance-id".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl InstanceIdStore for FileInstanceIdStore {
    fn read(&self) -> Result<InstanceId> {
        let text = fs::read_to_string(&self.path)?;
        text.parse::<InstanceId>()
            .map_err(|e| ClusterError::Io(format!("corrupt instance id in {}: {}", self.path.display(), e)))
    }

    /// Writes to a sibling temp file, syncs it, then renames over the target.
    fn write(&self, id: InstanceId) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            writeln!(file, "{}", id.0)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// Returns the stored id, or generates, stores, and returns a new one.
pub fn load_or_create(store: &dyn InstanceIdStore) -> Result<InstanceId> {
    match store.read() {
        Ok(id) => Ok(id),
        Err(e) => {
            warn!(error = %e, "Could not read instance id. Generating a new one.");
            let id = InstanceId::random();
            store.write(id)?;
            info!(instance = %id, "Persisted new instance id.");
            Ok(id)
        }
    }
}

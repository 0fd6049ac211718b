use std::fs;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::task::DownloadTask;

/// Durable home of the task snapshot. The whole map is written on every
/// mutation and read once at startup.
pub trait Storage: Send {
    fn load_all(&self) -> CoreResult<Vec<DownloadTask>>;
    fn save_all(&mut self, tasks: &[DownloadTask]) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    snapshot: Vec<DownloadTask>,
}

impl MemoryStorage {
    pub fn with_tasks(tasks: Vec<DownloadTask>) -> Self {
        Self { snapshot: tasks }
    }
}

impl Storage for MemoryStorage {
    fn load_all(&self) -> CoreResult<Vec<DownloadTask>> {
        Ok(self.snapshot.clone())
    }

    fn save_all(&mut self, tasks: &[DownloadTask]) -> CoreResult<()> {
        self.snapshot = tasks.to_vec();
        Ok(())
    }
}

pub struct JsonFileStorage {
    pub path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "tasks".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn staging_path(&self) -> PathBuf {
        self.sibling(".partial")
    }

    /// Where an unreadable snapshot is moved so the next save cannot
    /// overwrite it.
    pub fn corrupt_path(&self) -> PathBuf {
        self.sibling(".corrupt")
    }
}

impl Storage for JsonFileStorage {
    fn load_all(&self) -> CoreResult<Vec<DownloadTask>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read(&self.path).map_err(|err| CoreError::Persistence(err.to_string()))?;
        if content.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&content).map_err(|err| {
            let aside = self.corrupt_path();
            match fs::rename(&self.path, &aside) {
                Ok(()) => {
                    warn!(path = %self.path.display(), moved_to = %aside.display(), error = %err, "task snapshot is corrupt");
                    CoreError::Persistence(format!("{} (moved to {})", err, aside.display()))
                }
                Err(rename_err) => {
                    warn!(path = %self.path.display(), error = %rename_err, "could not move corrupt snapshot aside");
                    CoreError::Persistence(err.to_string())
                }
            }
        })
    }

    fn save_all(&mut self, tasks: &[DownloadTask]) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| CoreError::Persistence(err.to_string()))?;
            }
        }
        let content = serde_json::to_vec_pretty(tasks)
            .map_err(|err| CoreError::Persistence(err.to_string()))?;
        let staging = self.staging_path();
        fs::write(&staging, content).map_err(|err| CoreError::Persistence(err.to_string()))?;
        fs::rename(&staging, &self.path).map_err(|err| CoreError::Persistence(err.to_string()))
    }
}

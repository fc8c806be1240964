// Instance manager
//
// Creates, renames and deletes the persistent storage instances backing
// shard groups. All mutating operations are idempotent by instance name.
// The file-backed manager keeps one directory per instance under its base
// directory; the in-memory manager backs tests and single-process runs.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{AccessError, Result};
use crate::storage::{EventStorage, FileEventLog, MemoryEventStorage};

pub trait InstanceManager: Send + Sync {
    /// Create the named storage instance, or return the existing one.
    fn create_instance(&self, name: &str) -> Result<Arc<dyn EventStorage>>;

    /// Open an existing instance.
    fn open_instance(&self, name: &str) -> Result<Arc<dyn EventStorage>>;

    /// Rename an instance. The source must exist and the target name must
    /// be free; open handles are re-pointed.
    fn rename_instance(&self, from: &str, to: &str) -> Result<()>;

    /// Delete the named instance and its data. Deleting a missing instance
    /// is a no-op.
    fn delete_instance(&self, name: &str) -> Result<()>;

    fn list_instances(&self) -> Vec<String>;
}

pub struct FileInstanceManager {
    base_dir: PathBuf,
    open: DashMap<String, Arc<FileEventLog>>,
}

impl FileInstanceManager {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            open: DashMap::new(),
        })
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join("events.log")
    }
}

impl InstanceManager for FileInstanceManager {
    fn create_instance(&self, name: &str) -> Result<Arc<dyn EventStorage>> {
        if let Some(existing) = self.open.get(name) {
            return Ok(existing.clone());
        }
        let log = Arc::new(FileEventLog::open(self.log_path(name))?);
        self.open.insert(name.to_string(), log.clone());
        tracing::info!("created storage instance '{}'", name);
        Ok(log)
    }

    fn open_instance(&self, name: &str) -> Result<Arc<dyn EventStorage>> {
        if let Some(existing) = self.open.get(name) {
            return Ok(existing.clone());
        }
        if !self.instance_dir(name).exists() {
            return Err(AccessError::NotFound(format!(
                "storage instance '{}'",
                name
            )));
        }
        let log = Arc::new(FileEventLog::open(self.log_path(name))?);
        self.open.insert(name.to_string(), log.clone());
        Ok(log)
    }

    fn rename_instance(&self, from: &str, to: &str) -> Result<()> {
        if !self.instance_dir(from).exists() {
            return Err(AccessError::NotFound(format!("storage instance '{}'", from)));
        }
        if self.instance_dir(to).exists() {
            return Err(AccessError::AlreadyExists(format!(
                "storage instance '{}'",
                to
            )));
        }
        // drop the open handle before moving the directory
        self.open.remove(from);
        std::fs::rename(self.instance_dir(from), self.instance_dir(to))?;
        let log = Arc::new(FileEventLog::open(self.log_path(to))?);
        self.open.insert(to.to_string(), log);
        tracing::info!("renamed storage instance '{}' to '{}'", from, to);
        Ok(())
    }

    fn delete_instance(&self, name: &str) -> Result<()> {
        self.open.remove(name);
        let dir = self.instance_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
            tracing::info!("deleted storage instance '{}'", name);
        }
        Ok(())
    }

    fn list_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_dir())
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Instance manager over in-memory storage.
#[derive(Default)]
pub struct MemoryInstanceManager {
    instances: DashMap<String, Arc<MemoryEventStorage>>,
}

impl MemoryInstanceManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceManager for MemoryInstanceManager {
    fn create_instance(&self, name: &str) -> Result<Arc<dyn EventStorage>> {
        let instance = self
            .instances
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryEventStorage::new()))
            .clone();
        Ok(instance)
    }

    fn open_instance(&self, name: &str) -> Result<Arc<dyn EventStorage>> {
        self.instances
            .get(name)
            .map(|instance| instance.clone() as Arc<dyn EventStorage>)
            .ok_or_else(|| AccessError::NotFound(format!("storage instance '{}'", name)))
    }

    fn rename_instance(&self, from: &str, to: &str) -> Result<()> {
        if self.instances.contains_key(to) {
            return Err(AccessError::AlreadyExists(format!(
                "storage instance '{}'",
                to
            )));
        }
        let (_, instance) = self
            .instances
            .remove(from)
            .ok_or_else(|| AccessError::NotFound(format!("storage instance '{}'", from)))?;
        self.instances.insert(to.to_string(), instance);
        Ok(())
    }

    fn delete_instance(&self, name: &str) -> Result<()> {
        self.instances.remove(name);
        Ok(())
    }

    fn list_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

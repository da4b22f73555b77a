//! Byte mirror for disaster recovery
//!
//! Objects are addressed by their `/`-separated path relative to the storage
//! base (e.g. `web1/web1.crt`). The directory-backed implementation writes
//! them under another root, typically a separately mounted volume.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context};

use super::file_store::write_atomic;

pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn put(&self, key: &str, bytes: &[u8], mode: u32) -> anyhow::Result<()>;

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Remove every object under `prefix/`
    fn delete_prefix(&self, prefix: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .context(format!("Failed to create object store root {}", root.display()))?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("invalid object key: {:?}", key);
        }
        Ok(self.root.join(rel))
    }
}

impl ObjectStore for DirectoryObjectStore {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn put(&self, key: &str, bytes: &[u8], mode: u32) -> anyhow::Result<()> {
        write_atomic(&self.object_path(key)?, bytes, mode)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        super::file_store::read_optional(&self.object_path(key)?)
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        super::file_store::remove_if_exists(&self.object_path(key)?)
    }

    fn delete_prefix(&self, prefix: &str) -> anyhow::Result<()> {
        let dir = self.object_path(prefix)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("Failed to remove {}: {}", dir.display(), e)),
        }
    }
}

//! Small key-value persistence for engine state (ledger, run cursor).

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{ArchiveError, Result};

/// Default per-value limit, mirroring hosted property stores.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 500 * 1024;

/// Byte-oriented key-value store with a per-value size limit.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Largest value `set` accepts.
    fn max_value_size(&self) -> usize;
}

impl<K: KeyValueStore + ?Sized> KeyValueStore for &K {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn max_value_size(&self) -> usize {
        (**self).max_value_size()
    }
}

fn check_size(key: &str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(ArchiveError::InvalidInput(format!(
            "value for '{key}' is {len} bytes, limit is {max}"
        )));
    }
    Ok(())
}

/// In-memory store for tests and dry runs.
#[derive(Debug)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, Vec<u8>>>,
    max_value_size: usize,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_VALUE_SIZE)
    }
}

impl MemoryKv {
    pub fn with_limit(max_value_size: usize) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            max_value_size,
        }
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        check_size(key, value.len(), self.max_value_size)?;
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn max_value_size(&self) -> usize {
        self.max_value_size
    }
}

/// One file per key inside a state directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash never leaves a half-written value behind.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
    max_value_size: usize,
}

impl FileKv {
    /// Open (creating if needed) a state directory.
    pub fn open(dir: impl AsRef<Path>, max_value_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| ArchiveError::io(&dir, e))?;
        Ok(Self {
            dir,
            max_value_size,
        })
    }

    /// Path of the file backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArchiveError::io(path, e)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        check_size(key, value.len(), self.max_value_size)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let mut file = File::create(&tmp).map_err(|e| ArchiveError::io(&tmp, e))?;
        file.write_all(value).map_err(|e| ArchiveError::io(&tmp, e))?;
        file.sync_all().map_err(|e| ArchiveError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| ArchiveError::io(&path, e))?;

        debug!(key, bytes = value.len(), path = %path.display(), "Stored value");
        Ok(())
    }

    fn max_value_size(&self) -> usize {
        self.max_value_size
    }
}

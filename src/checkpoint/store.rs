use crate::checkpoint::{CheckpointError, CheckpointResult, CheckpointStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Stores each checkpoint as a file under one directory
///
/// Writes go to a temporary file that is renamed into place, so a reader never
/// sees a partially written checkpoint.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Opens the store, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, pointer: &str) -> CheckpointResult<PathBuf> {
        if pointer.is_empty() || pointer.contains('/') || pointer.contains('\\') || pointer.contains("..")
        {
            return Err(CheckpointError::InvalidPointer(pointer.to_string()));
        }
        Ok(self.dir.join(pointer))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn put(&self, pointer: &str, bytes: &[u8]) -> CheckpointResult<()> {
        let path = self.path_for(pointer)?;
        let tmp = self.dir.join(format!(".{}.tmp", pointer));
        let write_err = |e: std::io::Error| CheckpointError::Write {
            pointer: pointer.to_string(),
            message: e.to_string(),
        };

        fs::write(&tmp, bytes).map_err(write_err)?;
        fs::rename(&tmp, &path).map_err(write_err)
    }

    fn get(&self, pointer: &str) -> CheckpointResult<Option<Vec<u8>>> {
        let path = self.path_for(pointer)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::Read {
                pointer: pointer.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn delete(&self, pointer: &str) -> CheckpointResult<()> {
        let path = self.path_for(pointer)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Write {
                pointer: pointer.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// In-process checkpoint store
#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `put` fail, simulating an unreachable blob store
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, pointer: &str, bytes: &[u8]) -> CheckpointResult<()> {
        if *self.fail_writes.lock() {
            return Err(CheckpointError::Write {
                pointer: pointer.to_string(),
                message: "store unavailable".to_string(),
            });
        }
        self.blobs.lock().insert(pointer.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, pointer: &str) -> CheckpointResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(pointer).cloned())
    }

    fn delete(&self, pointer: &str) -> CheckpointResult<()> {
        self.blobs.lock().remove(pointer);
        Ok(())
    }
}

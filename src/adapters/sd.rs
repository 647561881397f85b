//! SD card adapters implementing [`FilePort`].
//!
//! On target the card is mounted through the ESP-IDF VFS (FAT) at
//! `/sdcard`, so plain `std::fs` reaches it. The host simulation points
//! [`SdCard`] at any directory. [`MemCard`] keeps files in memory and is
//! shared by clones, so a test can inspect what the store wrote.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};

use crate::app::ports::{FilePort, StorageError};

/// Default VFS mount point on target.
pub const SD_MOUNT_POINT: &str = "/sdcard";

fn map_io(e: &io::Error) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound,
        _ => StorageError::IoError,
    }
}

/// Filesystem-backed card rooted at a mount directory.
pub struct SdCard {
    root: PathBuf,
}

impl SdCard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl FilePort for SdCard {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        fs::read(self.full_path(path)).map_err(|e| map_io(&e))
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                warn!("sd: cannot create {}: {}", parent.display(), e);
                map_io(&e)
            })?;
        }
        fs::write(&full, data).map_err(|e| {
            warn!("sd: write {} failed: {}", full.display(), e);
            map_io(&e)
        })?;
        debug!("sd: wrote {} ({} bytes)", full.display(), data.len());
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.full_path(path).is_file()
    }
}

/// In-memory card. Clones share the same file table.
#[derive(Clone, Default)]
pub struct MemCard {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemCard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a file on the card.
    pub fn put(&self, path: &str, data: &[u8]) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_owned(), data.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }
}

impl FilePort for MemCard {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.get(path).ok_or(StorageError::NotFound)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.put(path, data);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.contains(path)
    }
}

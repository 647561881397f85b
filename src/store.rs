//! Two-tier configuration store.
//!
//! Records live in NVS (always present) and, when the card is mounted, as
//! JSON files on the SD card. Loads prefer the SD file; writes go to both
//! tiers. A write made while the card is absent marks the record pending
//! and is exported to the card on the next mount.
//!
//! ```text
//!  save_json ──▶ NVS blob ──┬──▶ SD file            (mounted)
//!                           └──▶ pending list       (unmounted)
//!  mount_sd  ──▶ pending list ──▶ SD file ──▶ StorageEvent::Synced
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::ports::{FilePort, StorageError, StoragePort};
use crate::config::{CONTROLLER_RECORD, POWER_POLICY_RECORD, RecordLocation, TEMP_RECORD};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, StorageEvent};

/// Largest blob read back from NVS.
pub const MAX_BLOB_SIZE: usize = 4000;

const META_NAMESPACE: &str = "cfg_meta";
const PENDING_KEY: &str = "pending";

/// Records the store knows how to export on mount.
const KNOWN_RECORDS: [RecordLocation; 3] = [TEMP_RECORD, POWER_POLICY_RECORD, CONTROLLER_RECORD];

/// Storage tier a record was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Sd,
    Nvs,
}

/// Raw bytes returned by [`ConfigStore::load_with_priority`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded {
    pub bytes: Vec<u8>,
    pub tier: Tier,
    /// Plain records are never encrypted at rest; NVS encryption is
    /// partition-wide and transparent.
    pub encrypted: bool,
}

struct Inner {
    nvs: Box<dyn StoragePort>,
    sd: Option<Box<dyn FilePort>>,
    /// SD paths written to NVS while the card was absent.
    pending: Vec<&'static str>,
    /// `set_typed` writes not yet committed.
    staged: Vec<(String, String, Vec<u8>)>,
}

pub struct ConfigStore {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
}

impl ConfigStore {
    pub fn new(nvs: Box<dyn StoragePort>, bus: Arc<EventBus>) -> Self {
        let pending = read_pending(nvs.as_ref());
        if !pending.is_empty() {
            info!("store: {} record(s) pending SD sync", pending.len());
        }
        Self {
            inner: Mutex::new(Inner {
                nvs,
                sd: None,
                pending,
                staged: Vec::new(),
            }),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── SD card lifecycle ─────────────────────────────────────

    /// Attach the SD tier and export pending records to it.
    ///
    /// Returns the number of records synced.
    pub fn mount_sd(&self, sd: Box<dyn FilePort>) -> Result<u16> {
        let synced = {
            let mut inner = self.lock();
            inner.sd = Some(sd);
            sync_pending(&mut inner)
        };
        info!("store: SD mounted, {} record(s) synced", synced);

        self.announce(StorageEvent::SdMounted);
        if synced > 0 {
            self.announce(StorageEvent::Synced { keys: synced });
        }
        Ok(synced)
    }

    /// Detach the SD tier. Later writes go to NVS only and are marked pending.
    pub fn unmount_sd(&self) {
        let was_mounted = self.lock().sd.take().is_some();
        if was_mounted {
            info!("store: SD unmounted");
            self.announce(StorageEvent::SdUnmounted);
        }
    }

    fn announce(&self, ev: StorageEvent) {
        if let Err(e) = self.bus.post(Event::Storage(ev), 0) {
            debug!("store: {:?} not posted: {}", ev, e);
        }
    }

    pub fn is_sd_mounted(&self) -> bool {
        self.lock().sd.is_some()
    }

    /// SD paths waiting for the next mount.
    pub fn pending_paths(&self) -> Vec<&'static str> {
        self.lock().pending.clone()
    }

    // ── Record access ─────────────────────────────────────────

    /// Read a record, SD file first, then NVS.
    pub fn load_with_priority(&self, loc: RecordLocation) -> Result<Loaded> {
        let inner = self.lock();
        if let Some(sd) = inner.sd.as_ref() {
            match sd.read_file(loc.path) {
                Ok(bytes) => {
                    debug!("store: {} loaded from SD ({} bytes)", loc.path, bytes.len());
                    return Ok(Loaded { bytes, tier: Tier::Sd, encrypted: false });
                }
                Err(StorageError::NotFound) => {}
                Err(e) => warn!("store: SD read of {} failed: {}", loc.path, e),
            }
        }
        let bytes = read_blob(inner.nvs.as_ref(), loc.namespace, loc.key)?;
        Ok(Loaded { bytes, tier: Tier::Nvs, encrypted: false })
    }

    /// Load and deserialize a JSON record.
    ///
    /// An unparseable SD file falls back to the NVS copy.
    pub fn load_json<T: DeserializeOwned>(&self, loc: RecordLocation) -> Result<(T, Tier)> {
        let loaded = self.load_with_priority(loc)?;
        match serde_json::from_slice(&loaded.bytes) {
            Ok(v) => Ok((v, loaded.tier)),
            Err(_) if loaded.tier == Tier::Sd => {
                warn!("store: {} on SD is malformed, trying NVS", loc.path);
                let inner = self.lock();
                let bytes = read_blob(inner.nvs.as_ref(), loc.namespace, loc.key)?;
                let v = serde_json::from_slice(&bytes)
                    .map_err(|_| Error::Internal("stored config corrupted"))?;
                Ok((v, Tier::Nvs))
            }
            Err(_) => Err(Error::Internal("stored config corrupted")),
        }
    }

    /// Write a JSON record to NVS and, when mounted, to the SD card.
    pub fn save_json<T: Serialize>(&self, loc: RecordLocation, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|_| Error::Internal("config serialization failed"))?;
        self.save_bytes(loc, &bytes)
    }

    fn save_bytes(&self, loc: RecordLocation, bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.nvs.write(loc.namespace, loc.key, bytes)?;

        let sd_result = match inner.sd.as_mut() {
            Some(sd) => sd.write_file(loc.path, bytes),
            None => Err(StorageError::NotMounted),
        };
        match sd_result {
            Ok(()) => {
                if let Some(pos) = inner.pending.iter().position(|p| *p == loc.path) {
                    inner.pending.remove(pos);
                    write_pending(&mut inner);
                }
            }
            Err(e) => {
                if !inner.pending.contains(&loc.path) {
                    inner.pending.push(loc.path);
                    write_pending(&mut inner);
                }
                if e != StorageError::NotMounted {
                    warn!("store: SD write of {} failed: {}, marked pending", loc.path, e);
                } else {
                    debug!("store: {} saved to NVS, SD sync pending", loc.path);
                }
            }
        }
        Ok(())
    }

    // ── Raw NVS blobs ─────────────────────────────────────────

    /// Read an NVS blob (binary records such as fan configs).
    pub fn read_blob(&self, namespace: &str, key: &str) -> Result<Vec<u8>> {
        read_blob(self.lock().nvs.as_ref(), namespace, key)
    }

    pub fn write_blob(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_BLOB_SIZE {
            return Err(Error::Storage(StorageError::Full));
        }
        self.lock().nvs.write(namespace, key, data)?;
        Ok(())
    }

    pub fn erase(&self, namespace: &str, key: &str) -> Result<()> {
        self.lock().nvs.delete(namespace, key)?;
        Ok(())
    }

    // ── Typed NVS values ──────────────────────────────────────

    /// Read a JSON-encoded NVS value, staged writes first.
    pub fn get_typed<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<T> {
        let inner = self.lock();
        let staged = inner
            .staged
            .iter()
            .rev()
            .find(|(ns, k, _)| ns == namespace && k == key)
            .map(|(_, _, v)| v.clone());
        let bytes = match staged {
            Some(b) => b,
            None => read_blob(inner.nvs.as_ref(), namespace, key)?,
        };
        serde_json::from_slice(&bytes).map_err(|_| Error::Internal("stored value corrupted"))
    }

    /// [`get_typed`](Self::get_typed), falling back to `default` when absent
    /// or unreadable.
    pub fn get_typed_or<T: DeserializeOwned>(&self, namespace: &str, key: &str, default: T) -> T {
        self.get_typed(namespace, key).unwrap_or(default)
    }

    /// Stage a JSON-encoded NVS value; persisted by [`commit`](Self::commit).
    pub fn set_typed<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|_| Error::Internal("value serialization failed"))?;
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(Error::Storage(StorageError::Full));
        }
        self.lock().staged.push((namespace.to_owned(), key.to_owned(), bytes));
        Ok(())
    }

    /// Flush staged writes to NVS.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock();
        let staged = core::mem::take(&mut inner.staged);
        for (ns, key, bytes) in &staged {
            inner.nvs.write(ns, key, bytes)?;
        }
        if !staged.is_empty() {
            debug!("store: committed {} value(s)", staged.len());
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn read_blob(nvs: &dyn StoragePort, namespace: &str, key: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_BLOB_SIZE];
    let len = nvs.read(namespace, key, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

fn read_pending(nvs: &dyn StoragePort) -> Vec<&'static str> {
    let Ok(bytes) = read_blob(nvs, META_NAMESPACE, PENDING_KEY) else {
        return Vec::new();
    };
    let paths: Vec<String> = postcard::from_bytes(&bytes).unwrap_or_default();
    KNOWN_RECORDS
        .iter()
        .map(|r| r.path)
        .filter(|p| paths.iter().any(|s| s == p))
        .collect()
}

fn write_pending(inner: &mut Inner) {
    let paths: Vec<&str> = inner.pending.clone();
    match postcard::to_allocvec(&paths) {
        Ok(bytes) => {
            if let Err(e) = inner.nvs.write(META_NAMESPACE, PENDING_KEY, &bytes) {
                warn!("store: failed to persist pending list: {}", e);
            }
        }
        Err(_) => warn!("store: failed to encode pending list"),
    }
}

fn sync_pending(inner: &mut Inner) -> u16 {
    let pending = core::mem::take(&mut inner.pending);
    let mut synced = 0u16;
    let mut still_pending = Vec::new();

    for path in pending {
        let Some(loc) = KNOWN_RECORDS.iter().find(|r| r.path == path) else {
            continue;
        };
        let bytes = match read_blob(inner.nvs.as_ref(), loc.namespace, loc.key) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let Some(sd) = inner.sd.as_mut() else {
            still_pending.push(path);
            continue;
        };
        match sd.write_file(path, &bytes) {
            Ok(()) => {
                synced += 1;
                info!("store: {} synced to SD", path);
            }
            Err(e) => {
                warn!("store: failed to sync {}: {}", path, e);
                still_pending.push(path);
            }
        }
    }

    inner.pending = still_pending;
    write_pending(inner);
    synced
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Key-value storage areas backing the durable store.
//!
//! An area is a flat JSON object keyed by string. Every write is reported on
//! a broadcast channel together with the new values, so readers holding a
//! cache can tell whether the change affects them.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("quota exceeded in {area}: {needed} bytes > {quota} bytes")]
    QuotaExceeded {
        area: String,
        needed: usize,
        quota: usize,
    },
    #[error("storage area {area} unavailable: {reason}")]
    Unavailable { area: String, reason: String },
}

/// Notification of keys written or removed in an area.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub area: String,
    /// Key and its new value (`None` when removed).
    pub changes: Vec<(String, Option<Value>)>,
}

/// A persistence tier.
pub trait StorageArea: Send + Sync {
    fn name(&self) -> &str;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>>;

    /// Write all entries in a single operation.
    fn set(&self, entries: Vec<(String, Value)>) -> BoxFuture<'_, Result<(), StorageError>>;

    fn remove(&self, keys: Vec<String>) -> BoxFuture<'_, Result<(), StorageError>>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

fn serialized_len(map: &Map<String, Value>) -> usize {
    serde_json::to_vec(map).map(|v| v.len()).unwrap_or(usize::MAX)
}

fn check_quota(area: &str, map: &Map<String, Value>, quota: Option<usize>) -> Result<(), StorageError> {
    if let Some(quota) = quota {
        let needed = serialized_len(map);
        if needed > quota {
            return Err(StorageError::QuotaExceeded {
                area: area.to_string(),
                needed,
                quota,
            });
        }
    }
    Ok(())
}

/// In-memory area. Used for tests and as a scratch tier.
pub struct MemoryArea {
    name: String,
    data: Mutex<Map<String, Value>>,
    quota: Option<usize>,
    available: AtomicBool,
    writes: AtomicUsize,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryArea {
    pub fn new(name: &str) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            data: Mutex::new(Map::new()),
            quota: None,
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
            changes,
        }
    }

    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Seed contents without emitting a change.
    pub fn with_contents(self, contents: Value) -> Self {
        if let Value::Object(map) = contents {
            *self.data.lock() = map;
        }
        self
    }

    /// Simulate the tier disappearing (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `set`/`remove` operations.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(self.data.lock().clone())
    }

    /// Apply a write that originated elsewhere (e.g. synced from another
    /// device). Not counted as a local write.
    pub fn apply_external(&self, key: &str, value: Option<Value>) {
        {
            let mut data = self.data.lock();
            match &value {
                Some(v) => {
                    data.insert(key.to_string(), v.clone());
                }
                None => {
                    data.remove(key);
                }
            }
        }
        let _ = self.changes.send(StorageChange {
            area: self.name.clone(),
            changes: vec![(key.to_string(), value)],
        });
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                area: self.name.clone(),
                reason: "tier offline".into(),
            })
        }
    }
}

impl StorageArea for MemoryArea {
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        Box::pin(async move {
            self.ensure_available()?;
            Ok(self.data.lock().get(key).cloned())
        })
    }

    fn set(&self, entries: Vec<(String, Value)>) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.ensure_available()?;
            {
                let mut data = self.data.lock();
                let mut next = data.clone();
                for (key, value) in &entries {
                    next.insert(key.clone(), value.clone());
                }
                check_quota(&self.name, &next, self.quota)?;
                *data = next;
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let _ = self.changes.send(StorageChange {
                area: self.name.clone(),
                changes: entries.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            });
            Ok(())
        })
    }

    fn remove(&self, keys: Vec<String>) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            self.ensure_available()?;
            {
                let mut data = self.data.lock();
                for key in &keys {
                    data.remove(key);
                }
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let _ = self.changes.send(StorageChange {
                area: self.name.clone(),
                changes: keys.into_iter().map(|k| (k, None)).collect(),
            });
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// Area persisted as a single JSON file, rewritten atomically on each write.
pub struct FileArea {
    name: String,
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
    write_lock: tokio::sync::Mutex<()>,
    quota: Option<usize>,
    changes: broadcast::Sender<StorageChange>,
}

impl FileArea {
    /// Open (or lazily create) the file-backed area.
    ///
    /// A file that does not hold a JSON object is treated as corrupted: it
    /// is logged and the area starts empty.
    pub fn open(name: &str, path: &Path, quota: Option<usize>) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => {
                    debug!("Loaded storage area {} from {:?}", name, path);
                    map
                }
                Ok(_) | Err(_) => {
                    warn!("Storage area {} at {:?} is corrupted, resetting", name, path);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!("Failed to read storage area {} at {:?}: {}", name, path, e);
                Map::new()
            }
        };
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            data: Mutex::new(data),
            write_lock: tokio::sync::Mutex::new(()),
            quota,
            changes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, next: Map<String, Value>) -> Result<(), StorageError> {
        let unavailable = |reason: String| StorageError::Unavailable {
            area: self.name.clone(),
            reason,
        };
        let content =
            serde_json::to_string_pretty(&next).map_err(|e| unavailable(e.to_string()))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &content))
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;
        *self.data.lock() = next;
        Ok(())
    }
}

fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl StorageArea for FileArea {
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        Box::pin(async move { Ok(self.data.lock().get(key).cloned()) })
    }

    fn set(&self, entries: Vec<(String, Value)>) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut next = self.data.lock().clone();
            for (key, value) in &entries {
                next.insert(key.clone(), value.clone());
            }
            check_quota(&self.name, &next, self.quota)?;
            self.persist(next).await?;
            let _ = self.changes.send(StorageChange {
                area: self.name.clone(),
                changes: entries.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            });
            Ok(())
        })
    }

    fn remove(&self, keys: Vec<String>) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut next = self.data.lock().clone();
            for key in &keys {
                next.remove(key);
            }
            self.persist(next).await?;
            let _ = self.changes.send(StorageChange {
                area: self.name.clone(),
                changes: keys.into_iter().map(|k| (k, None)).collect(),
            });
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

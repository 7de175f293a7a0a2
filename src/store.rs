//! Flat JSON persistence.
//!
//! Each resource type lives in its own `<data_dir>/<name>.json` file holding a
//! JSON array. Reads parse the whole file; writes replace it atomically via a
//! temp file and rename. A per-store async mutex serializes read-modify-write
//! cycles so concurrent requests cannot lose each other's updates.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode records: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A persisted resource. Keys compare case-insensitively.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn key(&self) -> String;
}

pub struct JsonStore<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> JsonStore<T> {
    pub fn new(data_dir: &Path, name: &str) -> Self {
        Self {
            path: data_dir.join(format!("{}.json", name)),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<T>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_all(&self, records: &[T]) -> Result<()> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let body = serde_json::to_vec_pretty(records)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&body).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_err(source));
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<T>> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        Ok(self.list().await?.into_iter().find(|r| r.key().eq_ignore_ascii_case(key)))
    }

    /// Replaces the record with the same key, or appends. Returns true when
    /// the record is new.
    pub async fn upsert(&self, record: T) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let key = record.key();

        let created = match records.iter_mut().find(|r| r.key().eq_ignore_ascii_case(&key)) {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                records.push(record);
                true
            }
        };
        self.write_all(&records).await?;
        Ok(created)
    }

    /// Applies `change` to the record with `key` and persists it.
    pub async fn update<F>(&self, key: &str, change: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut T) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let Some(record) = records.iter_mut().find(|r| r.key().eq_ignore_ascii_case(key)) else {
            return Ok(None);
        };
        change(record);
        let updated = record.clone();
        self.write_all(&records).await?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, key: &str) -> Result<Option<T>> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let Some(index) = records.iter().position(|r| r.key().eq_ignore_ascii_case(key)) else {
            return Ok(None);
        };
        let removed = records.remove(index);
        self.write_all(&records).await?;
        Ok(Some(removed))
    }

    /// Drops every record matching `predicate`; returns the removed ones.
    pub async fn retain<F>(&self, mut keep: F) -> Result<Vec<T>>
    where
        F: FnMut(&T) -> bool + Send,
    {
        let _guard = self.lock.lock().await;
        let records = self.read_all().await?;
        let (kept, removed): (Vec<T>, Vec<T>) = records.into_iter().partition(|r| keep(r));
        if !removed.is_empty() {
            self.write_all(&kept).await?;
        }
        Ok(removed)
    }
}

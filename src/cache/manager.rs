//! Durable key/value cache backed by one JSON file per key
//!
//! Provides a `Cache` that stores serializable values with a TTL, keeps
//! hit/miss/size statistics, and observes the caller's [`Context`] at every
//! suspension point.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tokio::fs;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};

use super::entry::{entry_path, CacheEntry, ENTRY_EXTENSION};
use super::{CacheError, CacheStats};
use crate::context::Context;

/// Extension of in-progress writes; never read as entries
const TEMP_EXTENSION: &str = "tmp";

/// Reads and writes cache entries in a single flat directory
///
/// Writes to the same key are mutually exclusive while reads of a key may
/// overlap. Each write lands in a temporary file that is renamed into place,
/// so readers never observe a partial entry even when a write is cancelled.
/// The cache assumes it is the only process using its directory.
#[derive(Debug)]
pub struct Cache {
    /// Directory where cache files are stored
    dir: PathBuf,
    /// Shared by get/set/delete, taken exclusively by clear
    gate: RwLock<()>,
    /// Per-file reader/writer locks
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
    stats: Mutex<CacheStats>,
    temp_seq: AtomicU64,
}

impl Cache {
    /// Opens the cache rooted at `dir`, creating the directory if needed
    ///
    /// Entry files already present count towards `size`. Temporary files left
    /// by an interrupted write are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(CacheError::InvalidDirectory(
                "cache directory path is empty".to_string(),
            ));
        }

        fs::create_dir_all(&dir)
            .await
            .map_err(|source| CacheError::io(&dir, source))?;
        let metadata = fs::metadata(&dir)
            .await
            .map_err(|source| CacheError::io(&dir, source))?;
        if !metadata.is_dir() {
            return Err(CacheError::InvalidDirectory(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let mut swept = 0usize;
        for temp in entry_files(&dir, TEMP_EXTENSION).await? {
            match fs::remove_file(&temp).await {
                Ok(()) => swept += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %temp.display(), error = %err, "Could not remove stray temp file"),
            }
        }

        let size = entry_files(&dir, ENTRY_EXTENSION).await?.len();
        info!(dir = %dir.display(), size, swept, "Opened cache");

        Ok(Self {
            dir,
            gate: RwLock::new(()),
            locks: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats {
                size,
                ..CacheStats::default()
            }),
            temp_seq: AtomicU64::new(0),
        })
    }

    /// Directory holding the entry files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path to the cache file for the given key
    pub fn path(&self, key: &str) -> PathBuf {
        entry_path(&self.dir, key)
    }

    /// Whether `entry` has outlived its TTL at `now`
    pub fn is_expired<T>(entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
        super::is_expired(entry, now)
    }

    /// Snapshot of hit/miss counters and the current entry count
    pub fn stats(&self) -> CacheStats {
        *self.stats_mut()
    }

    /// Writes `value` under `key`, fresh for `ttl` (zero or negative never expires)
    ///
    /// Fails before touching the filesystem if `ctx` is already done.
    #[instrument(skip(self, ctx, value))]
    pub async fn set<T>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        ttl: TimeDelta,
    ) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let entry = CacheEntry::new(key, value, ttl);
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|source| CacheError::Serialize {
            key: key.to_string(),
            source,
        })?;

        let path = self.path(key);
        let _gate = race(ctx, self.gate.read()).await?;
        let lock = self.key_lock(&path);
        let _writer = race(ctx, lock.write()).await?;

        let temp = self.temp_path(&path);
        let written = match race(ctx, fs::write(&temp, &bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(CacheError::io(&temp, source)),
            Err(cancelled) => Err(cancelled),
        };
        if let Err(err) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        let existed = fs::try_exists(&path).await.unwrap_or(false);
        if let Err(source) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::io(&path, source));
        }

        if !existed {
            self.stats_mut().size += 1;
        }
        debug!(key, replaced = existed, "Cache entry written");
        Ok(())
    }

    /// Reads the value stored under `key`
    ///
    /// A missing or expired entry counts as a miss; a fresh one as a hit.
    /// An unparseable entry returns [`CacheError::Deserialize`] and leaves
    /// both counters alone.
    pub async fn get<T: DeserializeOwned>(&self, ctx: &Context, key: &str) -> Result<T, CacheError> {
        self.get_entry(ctx, key).await.map(|entry| entry.payload)
    }

    /// Like [`Cache::get`] but returns the whole envelope, including write time and TTL
    #[instrument(skip(self, ctx))]
    pub async fn get_entry<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<CacheEntry<T>, CacheError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let path = self.path(key);
        let _gate = race(ctx, self.gate.read()).await?;
        let lock = self.key_lock(&path);
        let _reader = race(ctx, lock.read()).await?;

        let bytes = match race(ctx, fs::read(&path)).await? {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.stats_mut().record_miss();
                debug!(key, "Cache miss");
                return Err(CacheError::Miss(key.to_string()));
            }
            Err(source) => return Err(CacheError::io(&path, source)),
        };

        let entry: CacheEntry<T> =
            serde_json::from_slice(&bytes).map_err(|source| CacheError::Deserialize {
                key: key.to_string(),
                source,
            })?;

        if entry.is_expired_at(Utc::now()) {
            self.stats_mut().record_miss();
            debug!(key, written_at = %entry.written_at, "Cache entry expired");
            return Err(CacheError::Expired(key.to_string()));
        }

        self.stats_mut().record_hit();
        Ok(entry)
    }

    /// Whether a file exists for `key`, fresh or not; does not touch the counters
    pub async fn contains(&self, key: &str) -> bool {
        fs::try_exists(self.path(key)).await.unwrap_or(false)
    }

    /// Removes the entry for `key`; removing an absent key is not an error
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path(key);
        let _gate = self.gate.read().await;
        let lock = self.key_lock(&path);
        let _writer = lock.write().await;

        match fs::remove_file(&path).await {
            Ok(()) => {
                let mut stats = self.stats_mut();
                stats.size = stats.size.saturating_sub(1);
                debug!(key, "Cache entry deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::io(&path, source)),
        }
    }

    /// Removes every entry; hit and miss counters are kept
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), CacheError> {
        let _gate = self.gate.write().await;

        let mut files = entry_files(&self.dir, ENTRY_EXTENSION).await?;
        files.extend(entry_files(&self.dir, TEMP_EXTENSION).await?);

        let mut removed = 0usize;
        for file in files {
            match fs::remove_file(&file).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(CacheError::io(file, source)),
            }
        }

        // Nobody holds a key lock while the gate is held exclusively.
        self.locks_mut().clear();
        self.stats_mut().size = 0;
        info!(removed, "Cache cleared");
        Ok(())
    }

    /// Deletes entries that have expired and returns how many were removed
    ///
    /// Entries that cannot be parsed are left in place.
    #[instrument(skip(self, ctx))]
    pub async fn prune_expired(&self, ctx: &Context) -> Result<usize, CacheError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let _gate = race(ctx, self.gate.read()).await?;
        let now = Utc::now();
        let mut removed = 0usize;

        for path in entry_files(&self.dir, ENTRY_EXTENSION).await? {
            if let Some(reason) = ctx.err() {
                return Err(reason.into());
            }

            let lock = self.key_lock(&path);
            let _writer = lock.write().await;

            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(source) => return Err(CacheError::io(&path, source)),
            };
            let entry: CacheEntry<IgnoredAny> = match serde_json::from_slice(&bytes) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable cache entry");
                    continue;
                }
            };

            if entry.is_expired_at(now) {
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        removed += 1;
                        let mut stats = self.stats_mut();
                        stats.size = stats.size.saturating_sub(1);
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(source) => return Err(CacheError::io(&path, source)),
                }
            }
        }

        debug!(removed, "Pruned expired cache entries");
        Ok(removed)
    }

    fn key_lock(&self, path: &Path) -> KeyLock<'_> {
        let lock = Arc::clone(
            self.locks_mut()
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        );
        KeyLock {
            cache: self,
            path: path.to_path_buf(),
            lock,
        }
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("{seq}.{TEMP_EXTENSION}"))
    }

    fn stats_mut(&self) -> MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locks_mut(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<RwLock<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle on one key's lock
///
/// Must outlive any guard taken from it. Dropping the last handle removes the
/// lock from the map, so the map only holds keys that are in use.
struct KeyLock<'a> {
    cache: &'a Cache,
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl KeyLock<'_> {
    async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.cache.locks_mut();
        // Handles are only cloned under the map mutex, so the count cannot
        // grow while it is held. Two owners means the map and this handle.
        let idle = locks
            .get(&self.path)
            .is_some_and(|held| Arc::ptr_eq(held, &self.lock) && Arc::strong_count(&self.lock) == 2);
        if idle {
            locks.remove(&self.path);
        }
    }
}

/// Runs `fut` unless `ctx` finishes first
async fn race<F: Future>(ctx: &Context, fut: F) -> Result<F::Output, CacheError> {
    tokio::select! {
        biased;
        reason = ctx.done() => Err(CacheError::Cancelled(reason)),
        output = fut => Ok(output),
    }
}

/// Regular files in `dir` with the given extension
async fn entry_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, CacheError> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|source| CacheError::io(dir, source))?;

    while let Some(item) = entries
        .next_entry()
        .await
        .map_err(|source| CacheError::io(dir, source))?
    {
        let path = item.path();
        let is_file = item.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    Ok(files)
}

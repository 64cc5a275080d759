//! Keyed locks guarding per-entity work (`repo:`, `server:`, `command:`,
//! `workdir:` keys).
//!
//! Each key is held at two levels: an async mutex orders the tasks of this
//! process, and an exclusive `fs2` lock on `<lock dir>/<key>.lock` orders the
//! daemon against CLI invocations sharing the same data directory.

use fs2::FileExt;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::store::StoreError;
use crate::platform::{NativePlatform, Platform};

/// An exclusive advisory lock on a file, released on drop.
pub(crate) struct FileLock {
    file: fs::File,
}

impl FileLock {
    fn open(path: &Path) -> io::Result<fs::File> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        NativePlatform::restrict_file_permissions(path);
        Ok(file)
    }

    /// Blocks on a pool thread until the lock is free.
    pub(crate) async fn acquire(path: PathBuf) -> io::Result<Self> {
        tokio::task::spawn_blocking(move || {
            let file = Self::open(&path)?;
            file.lock_exclusive()?;
            Ok(Self { file })
        })
        .await
        .map_err(io::Error::other)?
    }

    /// `Ok(None)` when another holder has the lock.
    pub(crate) fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Clone)]
pub struct EntityLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    dir: Arc<PathBuf>,
}

pub struct EntityGuard {
    // Declared first so the file lock is released before the mutex.
    _file: FileLock,
    _guard: OwnedMutexGuard<()>,
    key: String,
}

impl EntityGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl EntityLocks {
    /// Lock files live in `dir`, created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::default(),
            dir: Arc::new(dir.into()),
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        // Drop slots nobody holds or waits on.
        map.retain(|k, m| k == key || Arc::strong_count(m) > 1);
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", urlencoding::encode(key)))
    }

    /// Waits until the key is free in this and every other process.
    pub async fn lock(&self, key: impl Into<String>) -> Result<EntityGuard, StoreError> {
        let key = key.into();
        let guard = self.slot(&key).lock_owned().await;
        let path = self.file_for(&key);
        let file = FileLock::acquire(path.clone())
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(EntityGuard {
            _file: file,
            _guard: guard,
            key,
        })
    }

    /// `Ok(None)` when another task or process holds the key.
    pub fn try_lock(&self, key: impl Into<String>) -> Result<Option<EntityGuard>, StoreError> {
        let key = key.into();
        let Ok(guard) = self.slot(&key).try_lock_owned() else {
            return Ok(None);
        };
        let path = self.file_for(&key);
        let Some(file) = FileLock::try_acquire(&path).map_err(|e| StoreError::io(&path, e))? else {
            return Ok(None);
        };
        Ok(Some(EntityGuard {
            _file: file,
            _guard: guard,
            key,
        }))
    }
}

pub fn repo_key(name: &str) -> String {
    format!("repo:{name}")
}

pub fn server_key(host: &str) -> String {
    format!("server:{host}")
}

pub fn command_key(id: &str) -> String {
    format!("command:{id}")
}

pub fn workdir_key(host: &str, repo: &str) -> String {
    format!("workdir:{host}:{repo}")
}

//! Owner-only JSON documents with whole-document read-modify-write.
//!
//! Writers are serialized twice: an in-process async mutex orders tasks of
//! this process, and an exclusive `fs2` lock on `<file>.lock` orders the
//! daemon against CLI invocations touching the same data directory. Every
//! update re-reads the file under both locks, so concurrent read-modify-write
//! cycles never lose each other's changes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::StoreError;
use crate::core::locks::FileLock;
use crate::platform::{NativePlatform, Platform};

pub struct JsonDocument<T> {
    path: PathBuf,
    writer: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document. A missing file reads as `T::default()`.
    pub fn load(&self) -> Result<T, StoreError> {
        read_document(&self.path)
    }

    /// Apply `f` to a freshly loaded copy and persist it atomically.
    ///
    /// When `f` returns `Err` nothing is written.
    pub async fn update<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let _writer = self.writer.lock().await;
        let lock_path = self.lock_path();
        let lock = FileLock::acquire(lock_path.clone())
            .await
            .map_err(|e| StoreError::io(&lock_path, e))?;

        let mut doc = read_document(&self.path)?;
        let result = f(&mut doc)?;
        write_document(&self.path, &doc)?;

        drop(lock);
        Ok(result)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

fn read_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).map_err(|source| StoreError::Corrupted {
        path: path.to_path_buf(),
        source,
    })
}

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written document.
fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let json = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Corrupted {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    NativePlatform::restrict_file_permissions(tmp.path());
    tmp.write_all(&json).map_err(|e| StoreError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    NativePlatform::restrict_file_permissions(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
    struct Counter {
        value: u32,
    }

    #[tokio::test]
    async fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let doc: JsonDocument<Counter> = JsonDocument::new(dir.path().join("c.json"));
        assert_eq!(doc.load().unwrap().value, 0);
    }

    #[tokio::test]
    async fn failed_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let doc: JsonDocument<Counter> = JsonDocument::new(dir.path().join("c.json"));
        let res: Result<(), StoreError> = doc
            .update(|c| {
                c.value = 9;
                Err(StoreError::NotFound {
                    kind: "counter",
                    key: "x".into(),
                })
            })
            .await;
        assert!(res.is_err());
        assert!(!doc.path().exists());
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let doc: Arc<JsonDocument<Counter>> =
            Arc::new(JsonDocument::new(dir.path().join("c.json")));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let doc = doc.clone();
            handles.push(tokio::spawn(async move {
                doc.update(|c| {
                    c.value += 1;
                    Ok::<_, StoreError>(())
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(doc.load().unwrap().value, 16);
    }

    #[tokio::test]
    async fn update_waits_for_another_process_without_stalling_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let doc: Arc<JsonDocument<Counter>> =
            Arc::new(JsonDocument::new(dir.path().join("c.json")));
        let other = FileLock::try_acquire(&dir.path().join("c.json.lock"))
            .unwrap()
            .unwrap();

        let pending = {
            let doc = doc.clone();
            tokio::spawn(async move {
                doc.update(|c| {
                    c.value += 1;
                    Ok::<_, StoreError>(())
                })
                .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert_eq!(doc.load().unwrap().value, 0);

        drop(other);
        pending.await.unwrap().unwrap();
        assert_eq!(doc.load().unwrap().value, 1);
    }

    #[tokio::test]
    async fn corrupted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "{not json").unwrap();
        let doc: JsonDocument<Counter> = JsonDocument::new(&path);
        assert!(matches!(doc.load(), Err(StoreError::Corrupted { .. })));
    }
}

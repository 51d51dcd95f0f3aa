//! Write-once object store on the local filesystem.
//!
//! Keys map to relative paths under `root`:
//! ```text
//! {root}/to-be-processed/cap/2024/05/01/13/1714568400000-0a1b2c3d
//! ```
//! Writes land in `{root}/.staging/` first and are published with a hard
//! link, which fails atomically when the key already exists.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ingest_api::error::PluginError;
use ingest_api::object::{ObjectMeta, ObjectStore};

const STAGING_DIR: &str = ".staging";

#[derive(Debug)]
pub struct FileObjectStore {
    root: PathBuf,
    staging_seq: AtomicU64,
}

impl FileObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(STAGING_DIR))
            .map_err(|e| PluginError::from(e).with_context(format!("create {}", root.display())))?;
        tracing::info!(root = %root.display(), "file object store opened");
        Ok(Self { root, staging_seq: AtomicU64::new(0) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PluginError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn staging_path(&self) -> PathBuf {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(STAGING_DIR)
            .join(format!("{}-{seq}", std::process::id()))
    }
}

/// Keys are relative, `/`-separated and free of `.`/`..` segments.
fn validate_key(key: &str) -> Result<(), PluginError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        || key.split('/').next() == Some(STAGING_DIR);
    if invalid {
        return Err(PluginError::validation(format!("invalid object key '{key}'")));
    }
    Ok(())
}

fn meta_for(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
    let created_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64);
    ObjectMeta { key, size: metadata.len(), created_ms }
}

/// `modified` backdates the object; its mtime is what `created_ms` reports.
fn write_once(
    staging: &Path,
    target: &Path,
    bytes: &[u8],
    modified: Option<SystemTime>,
) -> io::Result<std::fs::Metadata> {
    std::fs::write(staging, bytes)?;
    if let Some(time) = modified {
        std::fs::File::options().write(true).open(staging)?.set_modified(time)?;
    }
    let published = publish(staging, target);
    let _ = std::fs::remove_file(staging);
    published?;
    std::fs::metadata(target)
}

fn publish(staging: &Path, target: &Path) -> io::Result<()> {
    // A concurrent delete may prune the parent between mkdir and link.
    for _ in 0..2 {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::hard_link(staging, target) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            result => return result,
        }
    }
    std::fs::hard_link(staging, target)
}

fn walk(root: &Path, dir: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if dir == root && entry.file_name() == STAGING_DIR {
                continue;
            }
            walk(root, &path, prefix, out)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                out.push(meta_for(key, &entry.metadata()?));
            }
        }
    }
    Ok(())
}

/// Remove now-empty directories between `path` and `root`.
fn prune_empty_parents(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, PluginError> + Send + 'static,
) -> Result<T, PluginError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PluginError::logic(format!("blocking file task failed: {e}")))?
}

impl FileObjectStore {
    async fn write(&self, key: &str, bytes: Vec<u8>, modified: Option<SystemTime>) -> Result<ObjectMeta, PluginError> {
        let target = self.path_for(key)?;
        let staging = self.staging_path();
        let owned_key = key.to_string();
        blocking(move || {
            let metadata = write_once(&staging, &target, &bytes, modified).map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => PluginError::conflict(format!("object '{owned_key}' already exists")),
                _ => PluginError::from(e).with_context(format!("put '{owned_key}'")),
            })?;
            Ok(meta_for(owned_key, &metadata))
        })
        .await
    }
}

impl ObjectStore for FileObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
        Box::pin(self.write(key, bytes, None))
    }

    fn put_created_at<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        created_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
        let modified = UNIX_EPOCH + Duration::from_millis(created_ms.max(0) as u64);
        Box::pin(self.write(key, bytes, Some(modified)))
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            tokio::fs::read(&path)
                .await
                .map_err(|e| PluginError::from(e).with_context(format!("get '{key}'")))
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectMeta>, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => Ok(Some(meta_for(key.to_string(), &m))),
                Ok(_) => Ok(None),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(PluginError::from(e).with_context(format!("head '{key}'"))),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectMeta>, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            let root = self.root.clone();
            // Only the directory named by the prefix needs walking.
            let start = match prefix.rfind('/') {
                Some(i) if validate_key(&prefix[..i]).is_ok() => root.join(&prefix[..i]),
                _ => root.clone(),
            };
            let owned_prefix = prefix.to_string();
            blocking(move || {
                let mut out = Vec::new();
                walk(&root, &start, &owned_prefix, &mut out)
                    .map_err(|e| PluginError::from(e).with_context(format!("list '{owned_prefix}'")))?;
                out.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(out)
            })
            .await
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    let root = self.root.clone();
                    let _ = blocking(move || {
                        prune_empty_parents(&root, &path);
                        Ok(())
                    })
                    .await;
                    Ok(true)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(PluginError::from(e).with_context(format!("delete '{key}'"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_api::error::ErrorKind;

    fn store() -> (tempfile::TempDir, FileObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_is_write_once() {
        let (_dir, store) = store();
        let meta = store.put("tbp/cap/2024/01/01/00/1-a", b"first".to_vec()).await.unwrap();
        assert_eq!(meta.size, 5);
        assert!(meta.created_ms > 0);

        let err = store.put("tbp/cap/2024/01/01/00/1-a", b"second".to_vec()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(store.get("tbp/cap/2024/01/01/00/1-a").await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn backdated_put_reports_given_creation_time() {
        let (_dir, store) = store();
        let meta = store
            .put_created_at("processed/tbp/cap/1-a", b"x".to_vec(), 1_700_000_000_000)
            .await
            .unwrap();
        assert_eq!(meta.created_ms, 1_700_000_000_000);

        let listed = store.list("processed/").await.unwrap();
        assert_eq!(listed[0].created_ms, 1_700_000_000_000);
        let err = store.put_created_at("processed/tbp/cap/1-a", Vec::new(), 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_dir, store) = store();
        assert!(store.get("tbp/none").await.unwrap_err().is_not_found());
        assert!(store.head("tbp/none").await.unwrap().is_none());
        assert!(!store.delete("tbp/none").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_sorted_and_prefix_scoped() {
        let (_dir, store) = store();
        for key in ["tbp/cap/b", "tbp/cap/a", "tbp/cape/x", "processed/tbp/cap/a"] {
            store.put(key, b"x".to_vec()).await.unwrap();
        }
        let keys: Vec<String> = store.list("tbp/cap/").await.unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["tbp/cap/a", "tbp/cap/b"]);

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|m| !m.key.starts_with(STAGING_DIR)));
    }

    #[tokio::test]
    async fn delete_prunes_empty_directories() {
        let (dir, store) = store();
        store.put("tbp/cap/2024/01/01/00/1-a", b"x".to_vec()).await.unwrap();
        assert!(store.delete("tbp/cap/2024/01/01/00/1-a").await.unwrap());
        assert!(!dir.path().join("tbp").exists());
        assert!(dir.path().join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn rejects_keys_escaping_the_root() {
        let (_dir, store) = store();
        for key in ["", "/abs", "a/../b", "a//b", ".staging/x", "a/./b"] {
            let err = store.put(key, b"x".to_vec()).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation, "{key}");
        }
    }
}

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use ingest_api::clock::Clock;
use ingest_api::error::PluginError;
use ingest_api::object::{ObjectMeta, ObjectStore};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectEvent {
    Created(ObjectMeta),
}

struct StoredObject {
    bytes: Arc<Vec<u8>>,
    created_ms: i64,
}

/// In-memory write-once object store.
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    clock: Arc<dyn Clock>,
}

impl MemoryObjectStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { objects: RwLock::new(BTreeMap::new()), clock }
    }

    fn read_objects(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StoredObject>> {
        match self.objects.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("object store read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_objects(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, StoredObject>> {
        match self.objects.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("object store write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn meta(key: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta { key: key.to_string(), size: object.bytes.len() as u64, created_ms: object.created_ms }
    }

    fn insert(&self, key: &str, bytes: Vec<u8>, created_ms: i64) -> Result<ObjectMeta, PluginError> {
        let mut objects = self.write_objects();
        if objects.contains_key(key) {
            return Err(PluginError::conflict(format!("object '{key}' already exists")));
        }
        let object = StoredObject { bytes: Arc::new(bytes), created_ms };
        let meta = Self::meta(key, &object);
        objects.insert(key.to_string(), object);
        Ok(meta)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
        Box::pin(async move { self.insert(key, bytes, self.clock.now_ms()) })
    }

    fn put_created_at<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        created_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
        Box::pin(async move { self.insert(key, bytes, created_ms) })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            self.read_objects()
                .get(key)
                .map(|o| o.bytes.as_ref().clone())
                .ok_or_else(|| PluginError::not_found(format!("object '{key}'")))
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectMeta>, PluginError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.read_objects().get(key).map(|o| Self::meta(key, o))) })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectMeta>, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .read_objects()
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, o)| Self::meta(k, o))
                .collect())
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PluginError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.write_objects().remove(key).is_some()) })
    }
}

// ---------------------------------------------------------------------------
// WatchedObjectStore — emits an event for every successful put
// ---------------------------------------------------------------------------

/// Decorator that turns object creation into [`ObjectEvent`]s.
pub struct WatchedObjectStore {
    inner: Arc<dyn ObjectStore>,
    events: mpsc::UnboundedSender<ObjectEvent>,
}

impl WatchedObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> (Self, mpsc::UnboundedReceiver<ObjectEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { inner, events }, rx)
    }

    fn announce(&self, meta: ObjectMeta) -> Result<ObjectMeta, PluginError> {
        if self.events.send(ObjectEvent::Created(meta.clone())).is_err() {
            tracing::debug!(key = %meta.key, "no storage watcher, created event dropped");
        }
        Ok(meta)
    }
}

impl ObjectStore for WatchedObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            let meta = self.inner.put(key, bytes).await?;
            self.announce(meta)
        })
    }

    fn put_created_at<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        created_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            let meta = self.inner.put_created_at(key, bytes, created_ms).await?;
            self.announce(meta)
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PluginError>> + Send + 'a>> {
        self.inner.get(key)
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectMeta>, PluginError>> + Send + 'a>> {
        self.inner.head(key)
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectMeta>, PluginError>> + Send + 'a>> {
        self.inner.list(prefix)
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PluginError>> + Send + 'a>> {
        self.inner.delete(key)
    }
}

/// Copy `from` to `to`, then delete `from`. The copy keeps the creation
/// time of `from`, so retention ages it from when the batch was written.
///
/// An existing destination counts as an earlier, interrupted move.
pub async fn relocate(store: &dyn ObjectStore, from: &str, to: &str) -> Result<(), PluginError> {
    let source = store
        .head(from)
        .await?
        .ok_or_else(|| PluginError::not_found(format!("object '{from}'")))?;
    let bytes = store.get(from).await?;
    match store.put_created_at(to, bytes, source.created_ms).await {
        Ok(_) => {}
        Err(e) if e.kind == ingest_api::error::ErrorKind::Conflict => {
            tracing::debug!(from, to, "destination already present");
        }
        Err(e) => return Err(e.with_context(format!("copy to '{to}'"))),
    }
    store.delete(from).await?;
    Ok(())
}

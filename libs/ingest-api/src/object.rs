use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub created_ms: i64,
}

/// Durable write-once object storage.
///
/// `put` never overwrites: writing an existing key fails with
/// `ErrorKind::Conflict`. Reading a missing key fails with `ErrorKind::NotFound`.
pub trait ObjectStore: Send + Sync {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>>;

    /// Same as `put`, but the object reports `created_ms` instead of the
    /// time of the write. Moves between namespaces keep the original age.
    fn put_created_at<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        created_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>>;

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PluginError>> + Send + 'a>>;

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectMeta>, PluginError>> + Send + 'a>>;

    /// All objects whose key starts with `prefix`, sorted by key.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectMeta>, PluginError>> + Send + 'a>>;

    /// Returns `false` when the key did not exist.
    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PluginError>> + Send + 'a>>;
}

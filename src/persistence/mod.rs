//! Durable key-value storage backing the message store.
//!
//! The message store only ever writes through the [`Persistence`] trait, so the
//! storage medium can be swapped without touching the delivery logic. Two
//! implementations are provided:
//! - [`sqlite::SqlitePersistence`] for durable storage
//! - [`memory::InMemoryPersistence`] for tests and embedders that do not need
//!   messages to survive a restart
//!
//! [`ReadOnly`] wraps either of them to inspect stored messages without
//! writing anything back.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use tracing::trace;

pub mod memory;
pub mod sqlite;

/// A single write produced by the message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    /// Insert or overwrite the record stored under `key`
    Put { key: String, record: String },
    /// Remove the record stored under `key`, if any
    Delete { key: String },
}

impl PersistOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Core trait for the storage medium.
///
/// Records are opaque serialized strings keyed by message id. Implementations
/// must be safe to call from any task; the message store batches and rate
/// limits its writes, so individual calls are expected to be infrequent.
pub trait Persistence: Send + Sync + 'static {
    /// Inserts or overwrites a record.
    fn put(
        &self,
        key: &str,
        record: String,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>>;

    /// Deletes a record. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>>;

    /// Reads every stored record.
    fn get_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<HashMap<String, String>>> + Send + 'static>>;

    /// Applies a batch of writes in order.
    ///
    /// The default implementation issues one call per operation; backends with
    /// transactions should override it to apply the batch atomically.
    fn apply<'a>(
        &'a self,
        batch: Vec<PersistOp>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            for op in batch {
                match op {
                    PersistOp::Put { key, record } => self.put(&key, record).await?,
                    PersistOp::Delete { key } => self.delete(&key).await?,
                }
            }
            Ok(())
        })
    }
}

/// Persistence which reads from `inner` and silently drops every write.
pub struct ReadOnly {
    inner: Arc<dyn Persistence>,
}

impl ReadOnly {
    pub fn new(inner: Arc<dyn Persistence>) -> Self {
        Self { inner }
    }
}

impl Persistence for ReadOnly {
    fn put(
        &self,
        key: &str,
        _record: String,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>> {
        trace!(key, "Read-only persistence, dropping write");
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>> {
        trace!(key, "Read-only persistence, dropping delete");
        Box::pin(async { Ok(()) })
    }

    fn get_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<HashMap<String, String>>> + Send + 'static>> {
        self.inner.get_all()
    }
}

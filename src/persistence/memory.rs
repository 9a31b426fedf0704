//! In-memory implementation of the persistence layer.
//!
//! Provides a thread-safe store backed by a concurrent hash map. Records live
//! as long as the [`InMemoryPersistence`] value (and its clones) do, which makes
//! it possible to simulate a restart by building a new message store on top of
//! a clone of the same instance.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use super::Persistence;

#[derive(Clone, Default)]
/// Thread-safe in-memory persistence implementation.
pub struct InMemoryPersistence {
    records: Arc<papaya::HashMap<String, String>>,
}

impl InMemoryPersistence {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.records.pin().get(key).cloned()
    }
}

impl Persistence for InMemoryPersistence {
    fn put(
        &self,
        key: &str,
        record: String,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>> {
        let self_clone = self.clone();
        let key = key.to_owned();
        Box::pin(async move {
            self_clone.records.pin().insert(key, record);
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>> {
        let self_clone = self.clone();
        let key = key.to_owned();
        Box::pin(async move {
            self_clone.records.pin().remove(&key);
            Ok(())
        })
    }

    fn get_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<HashMap<String, String>>> + Send + 'static>> {
        let self_clone = self.clone();
        Box::pin(async move {
            let guard = self_clone.records.guard();
            Ok(self_clone
                .records
                .iter(&guard)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        })
    }
}

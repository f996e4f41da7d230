//! In-memory stats store for tests/dev.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde_json::{Map, Value};

use warlog_core::TenantKey;
use warlog_stats::{FieldChange, FieldPath, TenantStats};

use super::{StatsStore, StoreError, decode};

/// JSON documents keyed by tenant, behind a lock.
///
/// Documents are stored as raw JSON and updated path by path, the same way
/// a document database applies partial updates.
#[derive(Debug, Default)]
pub struct InMemoryStatsStore {
    docs: RwLock<BTreeMap<TenantKey, Value>>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored document of `key`.
    pub fn document(&self, key: &TenantKey) -> Option<Value> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn find(&self, key: &TenantKey) -> Result<Option<TenantStats>, StoreError> {
        match self.document(key) {
            Some(doc) => decode(key, doc).map(Some),
            None => Ok(None),
        }
    }

    async fn apply(&self, key: &TenantKey, changes: &[FieldChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let doc = docs
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        for change in changes {
            apply_change(doc, change);
        }
        Ok(())
    }

    async fn unset(&self, key: &TenantKey, path: &FieldPath) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(docs
            .get_mut(key)
            .is_some_and(|doc| remove_path(doc, path.segments())))
    }

    async fn delete(&self, key: &TenantKey) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.remove(key).is_some())
    }

    async fn drop_all(&self) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let removed = docs.len() as u64;
        docs.clear();
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<TenantKey>, StoreError> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.keys().cloned().collect())
    }
}

/// Resolve `change` against the stored value at its path and write the
/// result, creating intermediate objects and replacing non-object ones.
fn apply_change(doc: &mut Value, change: &FieldChange) {
    let Some((last, parents)) = change.path.segments().split_last() else {
        return;
    };
    let Some(map) = object_at(doc, parents) else {
        return;
    };
    if let Some(value) = change.resolve(map.get(last.as_str())) {
        map.insert(last.clone(), value);
    }
}

fn object_at<'a>(doc: &'a mut Value, segments: &[String]) -> Option<&'a mut Map<String, Value>> {
    let mut cursor = doc;
    for segment in segments {
        cursor = as_object(cursor)?
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object(cursor)
}

fn remove_path(doc: &mut Value, segments: &[String]) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut cursor = doc;
    for segment in parents {
        cursor = match cursor.get_mut(segment.as_str()) {
            Some(next) => next,
            None => return false,
        };
    }
    cursor
        .as_object_mut()
        .is_some_and(|map| map.remove(last.as_str()).is_some())
}

fn as_object(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

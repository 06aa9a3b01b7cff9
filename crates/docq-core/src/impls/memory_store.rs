//! InMemoryItemStore - テスト・デモ用の ItemStore 実装
//!
//! # 設計メモ
//! - 全状態を 1 つの `tokio::sync::Mutex` で守る。find-and-modify はロック内で
//!   完結するので、lease 取得は外から見て atomic になる
//! - ID は `ulid::Generator` で単調増加させ、`BTreeMap` の順序を挿入順と一致させる
//! - unique index と TTL index は `ensure_index` で有効化される
//! - `set_available(false)` で障害を再現できる

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use ulid::Generator;

use crate::domain::{ItemId, QueueItem};
use crate::error::StoreError;
use crate::ports::{Clock, IndexField, IndexSpec, ItemFilter, ItemPatch, ItemStore, SystemClock};

/// Collection state.
///
/// Design:
/// - Documents are keyed by a monotonic ULID, so map order is insertion order.
/// - Every operation runs under one lock, which makes `find_one_and_update`
///   atomic in the same sense a document store's is.
struct MemoryState {
    docs: BTreeMap<ItemId, QueueItem>,
    indexes: Vec<IndexSpec>,
    unique_ordering_key: bool,
    ttl: Option<chrono::Duration>,
    ids: Generator,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            docs: BTreeMap::new(),
            indexes: Vec::new(),
            unique_ordering_key: false,
            ttl: None,
            ids: Generator::new(),
        }
    }

    /// Drop documents whose TTL has passed.
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let cutoff = now - ttl;
        self.docs
            .retain(|_, doc| doc.last_updated_time.is_none_or(|t| t >= cutoff));
    }

    fn allocate_id(&mut self) -> Result<ItemId, StoreError> {
        self.ids
            .generate()
            .map(ItemId::from)
            .map_err(|e| StoreError::Backend(format!("id generation failed: {e}")))
    }

    fn key_taken(&self, key: &str) -> bool {
        self.docs.values().any(|doc| doc.ordering_key == key)
    }
}

/// In-memory collection. Used by tests and by the demo binary; a real
/// deployment implements [`ItemStore`] over its document database.
pub struct InMemoryItemStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Indexes created so far.
    pub async fn indexes(&self) -> Vec<IndexSpec> {
        self.state.lock().await.indexes.clone()
    }

    /// Snapshot of all live documents in natural order.
    pub async fn snapshot(&self) -> Vec<QueueItem> {
        let mut state = self.state.lock().await;
        state.purge_expired(self.clock.now());
        state.docs.values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        }
    }
}

impl Default for InMemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn ensure_index(&self, index: IndexSpec) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.indexes.contains(&index) {
            return Ok(());
        }

        if index.unique && index.fields == [IndexField::OrderingKey] {
            let mut seen = std::collections::HashSet::new();
            for doc in state.docs.values() {
                if !seen.insert(doc.ordering_key.as_str()) {
                    return Err(StoreError::DuplicateKey {
                        key: doc.ordering_key.clone(),
                    });
                }
            }
            state.unique_ordering_key = true;
        }
        if let Some(ttl) = index.expire_after
            && index.fields.first() == Some(&IndexField::LastUpdatedTime)
        {
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Backend(format!("invalid ttl: {e}")))?;
            state.ttl = Some(ttl);
        }
        state.indexes.push(index);
        Ok(())
    }

    async fn insert(&self, mut item: QueueItem) -> Result<QueueItem, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        if state.unique_ordering_key && state.key_taken(&item.ordering_key) {
            return Err(StoreError::DuplicateKey {
                key: item.ordering_key,
            });
        }

        let id = state.allocate_id()?;
        item.id = Some(id);
        if item.created_time.is_none() {
            item.created_time = Some(now);
        }
        item.last_updated_time = Some(now);
        state.docs.insert(id, item.clone());
        Ok(item)
    }

    async fn delete(&self, id: ItemId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.docs.remove(&id).is_some())
    }

    async fn find_one_and_update(
        &self,
        filter: &ItemFilter,
        patch: &ItemPatch,
    ) -> Result<Option<QueueItem>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        let Some(doc) = state.docs.values_mut().find(|doc| filter.matches(doc)) else {
            return Ok(None);
        };
        patch.apply(doc);
        doc.last_updated_time = Some(now);
        Ok(Some(doc.clone()))
    }

    async fn update_many(&self, filter: &ItemFilter, patch: &ItemPatch) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        let mut modified = 0;
        for doc in state.docs.values_mut().filter(|doc| filter.matches(doc)) {
            patch.apply(doc);
            doc.last_updated_time = Some(now);
            modified += 1;
        }
        Ok(modified)
    }

    async fn find_first_by_sort_index(
        &self,
        ordering_key: &str,
    ) -> Result<Option<QueueItem>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired(self.clock.now());

        Ok(state
            .docs
            .values()
            .filter(|doc| doc.ordering_key == ordering_key)
            .min_by_key(|doc| doc.sort_index)
            .cloned())
    }

    async fn find(&self, filter: &ItemFilter, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired(self.clock.now());

        Ok(state
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &ItemFilter) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired(self.clock.now());

        Ok(state.docs.values().filter(|doc| filter.matches(doc)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CodeVersion, LeaseOwner};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn item(key: &str) -> QueueItem {
        QueueItem::new(serde_json::json!({"key": key}), key)
    }

    fn acquire() -> ItemPatch {
        ItemPatch::acquire(LeaseOwner::new("c - h/1"), CodeVersion::new("v1"))
    }

    #[tokio::test]
    async fn insert_assigns_id_and_timestamps() {
        let store = InMemoryItemStore::new();
        let stored = store.insert(item("a")).await.unwrap();
        assert!(stored.id.is_some());
        assert!(stored.created_time.is_some());
        assert_eq!(stored.created_time, stored.last_updated_time);
        assert_eq!(store.count(&ItemFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn find_one_and_update_leases_in_insertion_order() {
        let store = InMemoryItemStore::new();
        let first = store.insert(item("a")).await.unwrap();
        let second = store.insert(item("b")).await.unwrap();

        let leased = store
            .find_one_and_update(&ItemFilter::unleased(), &acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, first.id);
        assert!(leased.is_leased());

        let leased = store
            .find_one_and_update(&ItemFilter::unleased(), &acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, second.id);

        let none = store
            .find_one_and_update(&ItemFilter::unleased(), &acquire())
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn concurrent_leases_never_hand_out_the_same_item() {
        let store = Arc::new(InMemoryItemStore::new());
        for n in 0..20 {
            store.insert(item(&format!("k{n}"))).await.unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(doc) = store
                    .find_one_and_update(&ItemFilter::unleased(), &acquire())
                    .await
                    .unwrap()
                {
                    got.push(doc.id.unwrap());
                }
                got
            }));
        }

        let mut all = Vec::new();
        for j in joins {
            all.extend(j.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn unique_index_rejects_second_pending_key() {
        let store = InMemoryItemStore::new();
        store
            .ensure_index(IndexSpec::new([IndexField::OrderingKey]).unique())
            .await
            .unwrap();

        let first = store.insert(item("U1")).await.unwrap();
        let err = store.insert(item("U1")).await.unwrap_err();
        assert_eq!(err, StoreError::DuplicateKey { key: "U1".into() });

        // once the first one is gone the key is free again
        store.delete(first.id.unwrap()).await.unwrap();
        store.insert(item("U1")).await.unwrap();
    }

    #[tokio::test]
    async fn unique_index_creation_fails_on_existing_duplicates() {
        let store = InMemoryItemStore::new();
        store.insert(item("dup")).await.unwrap();
        store.insert(item("dup")).await.unwrap();
        let err = store
            .ensure_index(IndexSpec::new([IndexField::OrderingKey]).unique())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn find_first_by_sort_index_returns_smallest() {
        let store = InMemoryItemStore::new();
        store.insert(item("K").with_sort_index(Some(30))).await.unwrap();
        store.insert(item("K").with_sort_index(Some(10))).await.unwrap();
        store.insert(item("K").with_sort_index(Some(20))).await.unwrap();
        store.insert(item("other").with_sort_index(Some(1))).await.unwrap();

        let first = store.find_first_by_sort_index("K").await.unwrap().unwrap();
        assert_eq!(first.sort_index, Some(10));
        assert!(store.find_first_by_sort_index("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ttl_index_expires_old_documents() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let store = InMemoryItemStore::with_clock(clock.clone());
        store
            .ensure_index(
                IndexSpec::new([IndexField::LastUpdatedTime]).expire_after(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        store.insert(item("a")).await.unwrap();
        clock.advance(chrono::Duration::seconds(30));
        store.insert(item("b")).await.unwrap();
        clock.advance(chrono::Duration::seconds(45));

        let left = store.snapshot().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ordering_key, "b");
    }

    #[tokio::test]
    async fn update_many_stamps_and_counts() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let store = InMemoryItemStore::with_clock(clock.clone());
        store.insert(item("a")).await.unwrap();
        store.insert(item("b")).await.unwrap();
        store
            .find_one_and_update(&ItemFilter::unleased(), &acquire())
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(5));
        let n = store
            .update_many(&ItemFilter::leased(), &ItemPatch::release())
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.count(&ItemFilter::leased()).await.unwrap(), 0);

        let docs = store.snapshot().await;
        assert_eq!(docs[0].last_updated_time, Some(start + chrono::Duration::seconds(5)));
        assert_eq!(docs[1].last_updated_time, Some(start));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryItemStore::new();
        store.set_available(false);
        let err = store.insert(item("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        store.set_available(true);
        store.insert(item("a")).await.unwrap();
    }
}

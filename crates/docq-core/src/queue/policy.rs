//! Ordering policies: the only place the two queue flavours differ.
//!
//! The dispatcher, worker channels, backoff, repush and reclamation are shared.
//! A policy decides:
//! - whether pushes get a sort index,
//! - whether items are routed to consumers by topic,
//! - which indexes the pending collection needs (including uniqueness),
//! - whether a leased item may be consumed right now.

use async_trait::async_trait;

use crate::domain::QueueItem;
use crate::error::StoreError;
use crate::ports::{IndexField, IndexSpec, ItemStore};

#[async_trait]
pub trait OrderingPolicy: Send + Sync + 'static {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Pending items need a uniqueness constraint on `ordering_key`.
    fn requires_unique_key(&self) -> bool;

    /// Pushes are stamped with a monotonic `sort_index`.
    fn assigns_sort_index(&self) -> bool;

    /// Several consumers may be bound, one per topic.
    fn routes_by_topic(&self) -> bool;

    /// Indexes the pending collection needs beyond the common ones.
    fn pending_indexes(&self) -> Vec<IndexSpec>;

    /// Whether a leased item may be handed to its consumer now.
    ///
    /// This is a post-hoc check on an item already leased, not a pre-filter
    /// on the lease query.
    async fn is_eligible(
        &self,
        candidate: &QueueItem,
        store: &dyn ItemStore,
    ) -> Result<bool, StoreError>;
}

/// Items sharing an ordering key are consumed oldest-first.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictKeyOrder;

#[async_trait]
impl OrderingPolicy for StrictKeyOrder {
    fn name(&self) -> &'static str {
        "strict-key-order"
    }

    fn requires_unique_key(&self) -> bool {
        false
    }

    fn assigns_sort_index(&self) -> bool {
        true
    }

    fn routes_by_topic(&self) -> bool {
        true
    }

    fn pending_indexes(&self) -> Vec<IndexSpec> {
        vec![
            IndexSpec::new([IndexField::Topic, IndexField::Keys]),
            IndexSpec::new([IndexField::Topic, IndexField::LeaseOwner, IndexField::Id]),
            IndexSpec::new([IndexField::OrderingKey, IndexField::SortIndex]),
        ]
    }

    async fn is_eligible(
        &self,
        candidate: &QueueItem,
        store: &dyn ItemStore,
    ) -> Result<bool, StoreError> {
        let Some(index) = candidate.sort_index else {
            return Ok(true);
        };
        let oldest = store.find_first_by_sort_index(&candidate.ordering_key).await?;
        Ok(match oldest.and_then(|item| item.sort_index) {
            Some(oldest_index) => oldest_index >= index,
            None => true,
        })
    }
}

/// At most one pending item per ordering key; no ordering between items.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueKey;

#[async_trait]
impl OrderingPolicy for UniqueKey {
    fn name(&self) -> &'static str {
        "unique-key"
    }

    fn requires_unique_key(&self) -> bool {
        true
    }

    fn assigns_sort_index(&self) -> bool {
        false
    }

    fn routes_by_topic(&self) -> bool {
        false
    }

    fn pending_indexes(&self) -> Vec<IndexSpec> {
        vec![IndexSpec::new([IndexField::OrderingKey]).unique()]
    }

    async fn is_eligible(
        &self,
        _candidate: &QueueItem,
        _store: &dyn ItemStore,
    ) -> Result<bool, StoreError> {
        // the unique index already rules out a concurrent duplicate
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryItemStore;

    #[tokio::test]
    async fn strict_order_rejects_item_with_older_sibling() {
        let store = InMemoryItemStore::new();
        let older = store
            .insert(QueueItem::new(serde_json::Value::Null, "K").with_sort_index(Some(1)))
            .await
            .unwrap();
        let newer = store
            .insert(QueueItem::new(serde_json::Value::Null, "K").with_sort_index(Some(2)))
            .await
            .unwrap();

        assert!(StrictKeyOrder.is_eligible(&older, &store).await.unwrap());
        assert!(!StrictKeyOrder.is_eligible(&newer, &store).await.unwrap());

        store.delete(older.id.unwrap()).await.unwrap();
        assert!(StrictKeyOrder.is_eligible(&newer, &store).await.unwrap());
    }

    #[tokio::test]
    async fn strict_order_ignores_other_keys() {
        let store = InMemoryItemStore::new();
        store
            .insert(QueueItem::new(serde_json::Value::Null, "A").with_sort_index(Some(1)))
            .await
            .unwrap();
        let b = store
            .insert(QueueItem::new(serde_json::Value::Null, "B").with_sort_index(Some(2)))
            .await
            .unwrap();
        assert!(StrictKeyOrder.is_eligible(&b, &store).await.unwrap());
    }

    #[tokio::test]
    async fn unique_key_is_always_eligible() {
        let store = InMemoryItemStore::new();
        let item = QueueItem::new(serde_json::Value::Null, "U");
        assert!(UniqueKey.is_eligible(&item, &store).await.unwrap());
    }

    #[test]
    fn policies_declare_their_shape() {
        assert!(StrictKeyOrder.assigns_sort_index());
        assert!(StrictKeyOrder.routes_by_topic());
        assert!(!StrictKeyOrder.requires_unique_key());

        assert!(UniqueKey.requires_unique_key());
        assert!(!UniqueKey.routes_by_topic());
        assert!(UniqueKey.pending_indexes().iter().any(|i| i.unique));
    }
}

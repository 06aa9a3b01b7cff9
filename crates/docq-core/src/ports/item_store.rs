//! ItemStore port - the document store the queue coordinates through.
//!
//! The queue needs only a handful of primitives from its backend:
//! insert, delete by id, atomic conditional find-and-modify of one document,
//! a sorted range lookup, and index creation (including a unique index and a
//! TTL index). Anything offering those can back a queue.
//!
//! # Design
//! - `find_one_and_update` is the single synchronization point. Lease
//!   acquisition must be one atomic store operation, never read-then-write.
//! - Every update stamps `last_updated_time`; stale-lease reclamation and
//!   history TTL both rely on it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{CodeVersion, ItemId, LeaseOwner, QueueItem, Topic};
use crate::error::StoreError;

/// Document store collection holding queue items.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Create an index if it does not exist yet.
    async fn ensure_index(&self, index: IndexSpec) -> Result<(), StoreError>;

    /// Insert a new document and return it with its store-assigned id.
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError>;

    /// Delete by id. Returns whether a document was removed.
    async fn delete(&self, id: ItemId) -> Result<bool, StoreError>;

    /// Atomically find one document matching `filter`, apply `patch`, and
    /// return the post-update document.
    async fn find_one_and_update(
        &self,
        filter: &ItemFilter,
        patch: &ItemPatch,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Apply `patch` to every matching document. Returns the number modified.
    async fn update_many(&self, filter: &ItemFilter, patch: &ItemPatch) -> Result<u64, StoreError>;

    /// The document with the smallest `sort_index` among those sharing
    /// `ordering_key`.
    async fn find_first_by_sort_index(
        &self,
        ordering_key: &str,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Up to `limit` matching documents in natural order.
    async fn find(&self, filter: &ItemFilter, limit: usize) -> Result<Vec<QueueItem>, StoreError>;

    async fn count(&self, filter: &ItemFilter) -> Result<u64, StoreError>;
}

/// Lease condition of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unleased,
    Leased,
}

/// Conjunctive filter over item documents. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
    pub id: Option<ItemId>,
    pub lease: Option<LeaseState>,
    /// Topic must be one of these.
    pub topics: Option<Vec<Topic>>,
    pub ordering_key: Option<String>,
    /// Lease version differs from this one (an absent version also differs).
    pub lease_version_not: Option<CodeVersion>,
    /// Last update strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
}

impl ItemFilter {
    pub fn by_id(id: ItemId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn unleased() -> Self {
        Self {
            lease: Some(LeaseState::Unleased),
            ..Self::default()
        }
    }

    pub fn leased() -> Self {
        Self {
            lease: Some(LeaseState::Leased),
            ..Self::default()
        }
    }

    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = Some(topics);
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_lease_version_not(mut self, version: CodeVersion) -> Self {
        self.lease_version_not = Some(version);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn matches(&self, item: &QueueItem) -> bool {
        if let Some(id) = self.id
            && item.id != Some(id)
        {
            return false;
        }
        match self.lease {
            Some(LeaseState::Unleased) if item.is_leased() => return false,
            Some(LeaseState::Leased) if !item.is_leased() => return false,
            _ => {}
        }
        if let Some(topics) = &self.topics
            && !topics.contains(&item.topic)
        {
            return false;
        }
        if let Some(key) = &self.ordering_key
            && &item.ordering_key != key
        {
            return false;
        }
        if let Some(version) = &self.lease_version_not
            && item.lease_version.as_ref() == Some(version)
        {
            return false;
        }
        if let Some(before) = self.updated_before {
            match item.last_updated_time {
                Some(updated) if updated < before => {}
                _ => return false,
            }
        }
        true
    }
}

/// Change to the lease fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseUpdate {
    Acquire {
        owner: LeaseOwner,
        version: CodeVersion,
    },
    Release,
}

/// Partial update of an item document. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub lease: Option<LeaseUpdate>,
    pub log: Option<Vec<String>>,
    pub last_fail_time: Option<DateTime<Utc>>,
    pub fail_count: Option<u32>,
}

impl ItemPatch {
    pub fn acquire(owner: LeaseOwner, version: CodeVersion) -> Self {
        Self {
            lease: Some(LeaseUpdate::Acquire { owner, version }),
            ..Self::default()
        }
    }

    pub fn release() -> Self {
        Self {
            lease: Some(LeaseUpdate::Release),
            ..Self::default()
        }
    }

    /// Apply to a document. The caller stamps `last_updated_time`.
    pub fn apply(&self, item: &mut QueueItem) {
        match &self.lease {
            Some(LeaseUpdate::Acquire { owner, version }) => {
                item.lease_owner = Some(owner.clone());
                item.lease_version = Some(version.clone());
            }
            Some(LeaseUpdate::Release) => {
                item.lease_owner = None;
                item.lease_version = None;
            }
            None => {}
        }
        if let Some(log) = &self.log {
            item.log = log.clone();
        }
        if let Some(at) = self.last_fail_time {
            item.last_fail_time = Some(at);
        }
        if let Some(n) = self.fail_count {
            item.fail_count = n;
        }
    }
}

/// Indexed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexField {
    Id,
    LeaseOwner,
    Keys,
    Topic,
    OrderingKey,
    SortIndex,
    LastUpdatedTime,
}

/// Index definition. Indexes are built in the background by backends that
/// distinguish foreground and background builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub fields: Vec<IndexField>,
    pub unique: bool,
    /// Documents expire this long after the first indexed timestamp field.
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    pub fn new(fields: impl Into<Vec<IndexField>>) -> Self {
        Self {
            fields: fields.into(),
            unique: false,
            expire_after: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn leased_item(version: &str) -> QueueItem {
        let mut item = QueueItem::new(serde_json::Value::Null, "k");
        item.lease_owner = Some(LeaseOwner::new("h - h/1"));
        item.lease_version = Some(CodeVersion::new(version));
        item
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(ItemFilter::default().matches(&QueueItem::new(serde_json::Value::Null, "k")));
        assert!(ItemFilter::default().matches(&leased_item("v1")));
    }

    #[test]
    fn lease_state_filter() {
        let free = QueueItem::new(serde_json::Value::Null, "k");
        let held = leased_item("v1");
        assert!(ItemFilter::unleased().matches(&free));
        assert!(!ItemFilter::unleased().matches(&held));
        assert!(ItemFilter::leased().matches(&held));
        assert!(!ItemFilter::leased().matches(&free));
    }

    #[test]
    fn topic_filter_requires_membership() {
        let item = QueueItem::new(serde_json::Value::Null, "k").with_topic(Topic::new("a"));
        assert!(ItemFilter::unleased().with_topics(vec![Topic::new("a"), Topic::new("b")]).matches(&item));
        assert!(!ItemFilter::unleased().with_topics(vec![Topic::new("b")]).matches(&item));
    }

    #[test]
    fn version_and_age_filters() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut item = leased_item("old");
        item.last_updated_time = Some(t0);

        let stale_other_version = ItemFilter::leased()
            .with_lease_version_not(CodeVersion::new("new"))
            .updated_before(t0 + chrono::Duration::seconds(1));
        assert!(stale_other_version.matches(&item));

        let same_version = ItemFilter::leased().with_lease_version_not(CodeVersion::new("old"));
        assert!(!same_version.matches(&item));

        assert!(!ItemFilter::leased().updated_before(t0).matches(&item));
    }

    #[test]
    fn patch_acquires_and_releases_lease() {
        let mut item = QueueItem::new(serde_json::Value::Null, "k");
        ItemPatch::acquire(LeaseOwner::new("c - h/1"), CodeVersion::new("v1")).apply(&mut item);
        assert_eq!(item.lease_owner, Some(LeaseOwner::new("c - h/1")));
        assert_eq!(item.lease_version, Some(CodeVersion::new("v1")));

        let mut patch = ItemPatch::release();
        patch.fail_count = Some(2);
        patch.log = Some(vec!["e".into()]);
        patch.apply(&mut item);
        assert!(!item.is_leased());
        assert!(item.lease_version.is_none());
        assert_eq!(item.fail_count, 2);
        assert_eq!(item.log, vec!["e"]);
    }
}

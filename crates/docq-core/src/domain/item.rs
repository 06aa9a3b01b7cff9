//! Queue item document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{CodeVersion, ItemId, LeaseOwner, Topic};
use crate::error::ConsumeError;

/// One unit of work, stored as a single document.
///
/// The same shape is used for the pending collection and for the consumed
/// (history) collection.
///
/// Ownership of fields:
/// - `id`, `created_time`, `last_updated_time` are stamped by the store.
/// - `ordering_key`, `sort_index`, `topic`, `data` are fixed at push time.
/// - lease fields are written by the connector and the reaper.
/// - `log`, `fail_count`, `last_fail_time` are written by worker channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,

    /// Opaque producer payload, decoded only by the consumer.
    pub data: serde_json::Value,

    /// Secondary tags for external lookup. Not used for ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,

    /// Sort key (strict order) or uniqueness key (unique key).
    pub ordering_key: String,

    /// Position among items sharing `ordering_key`. Strict order only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_index: Option<i64>,

    #[serde(default)]
    pub topic: Topic,

    /// `None` means the item is free to be leased.
    #[serde(default)]
    pub lease_owner: Option<LeaseOwner>,

    #[serde(default)]
    pub lease_version: Option<CodeVersion>,

    /// Most recent failure lines, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,

    #[serde(default)]
    pub fail_count: u32,

    #[serde(default)]
    pub repush_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fail_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_time_ms: Option<u64>,
}

impl QueueItem {
    /// A fresh, unleased item on the default topic.
    pub fn new(data: serde_json::Value, ordering_key: impl Into<String>) -> Self {
        Self {
            id: None,
            data,
            keys: None,
            ordering_key: ordering_key.into(),
            sort_index: None,
            topic: Topic::default(),
            lease_owner: None,
            lease_version: None,
            log: Vec::new(),
            fail_count: 0,
            repush_count: 0,
            last_fail_time: None,
            created_time: None,
            last_updated_time: None,
            process_time_ms: None,
        }
    }

    pub fn with_keys(mut self, keys: Option<Vec<String>>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    pub fn with_sort_index(mut self, sort_index: Option<i64>) -> Self {
        self.sort_index = sort_index;
        self
    }

    pub fn is_leased(&self) -> bool {
        self.lease_owner.is_some()
    }

    /// Decode the payload into the consumer's own type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ConsumeError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| ConsumeError::failed(format!("json decode: {e}")))
    }

    /// Append a failure line to the bounded log.
    ///
    /// Returns `true` when the log was already full, in which case only the
    /// most recent `min(4, log_size - 2)` lines are kept before appending and
    /// the item has to be repushed. The repushed copy then has room for at
    /// least one more in-place failure whenever `log_size >= 2`.
    pub fn push_failure_log(&mut self, line: String, log_size: usize) -> bool {
        let full = self.log.len() >= log_size;
        if full {
            let keep = log_size.saturating_sub(2).min(4);
            let excess = self.log.len() - keep;
            self.log.drain(..excess);
        }
        self.log.push(line);
        full
    }

    /// Fresh document carrying this item's payload, ordering fields and
    /// history, with no id and no lease. `failed_at` keeps the copy inside
    /// the retry backoff window.
    pub fn repushed(&self, failed_at: DateTime<Utc>) -> QueueItem {
        QueueItem {
            id: None,
            data: self.data.clone(),
            keys: self.keys.clone(),
            ordering_key: self.ordering_key.clone(),
            sort_index: self.sort_index,
            topic: self.topic.clone(),
            lease_owner: None,
            lease_version: None,
            log: self.log.clone(),
            fail_count: self.fail_count,
            repush_count: self.repush_count + 1,
            last_fail_time: Some(failed_at),
            created_time: None,
            last_updated_time: None,
            process_time_ms: None,
        }
    }

    /// Copy destined for the consumed collection.
    pub fn archived(&self, process_time_ms: u64) -> QueueItem {
        let mut copy = self.clone();
        copy.id = None;
        copy.process_time_ms = Some(process_time_ms);
        copy
    }
}

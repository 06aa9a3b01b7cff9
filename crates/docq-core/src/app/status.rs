use serde::{Deserialize, Serialize};

/// Point-in-time item counts of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Items in the pending collection, leased or not.
    pub pending: u64,
    pub leased: u64,
    pub unleased: u64,
    /// Archived copies still within the history TTL.
    pub consumed: u64,
}

impl QueueCounts {
    /// Nothing left to consume.
    pub fn is_drained(&self) -> bool {
        self.pending == 0
    }
}

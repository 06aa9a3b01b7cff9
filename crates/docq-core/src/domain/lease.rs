//! Lease identity: who holds an item and which deployment they run.
//!
//! A lease is the pair `(lease_owner, lease_version)` recorded on the item
//! document itself. There is no separate lock table; the store's atomic
//! find-and-modify is what makes acquiring a lease exclusive.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Environment variable naming the running code version.
pub const VERSION_ENV: &str = "DOCQ_VERSION";

/// Opaque token of the dispatcher/channel holding a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseOwner(String);

impl LeaseOwner {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Owner token used by the connector when leasing on behalf of a channel.
    pub fn for_channel(connector: &str, channel: &str) -> Self {
        Self(format!("{connector} - {channel}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Version of the code/deployment that took a lease.
///
/// Leases taken by a different version than the running one are reclaimed
/// sooner than same-version leases: a replaced deployment can never finish them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeVersion(String);

impl CodeVersion {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Version from `DOCQ_VERSION`, or a random 6-digit tag when unset.
    pub fn from_env() -> Self {
        match std::env::var(VERSION_ENV) {
            Ok(v) if !v.trim().is_empty() => Self::new(v.trim()),
            _ => Self::random(),
        }
    }

    pub fn random() -> Self {
        let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
        Self(format!("{n:06}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Host identity used to name channels and the connector.
pub fn host_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "undefined".to_string())
}

//! Stale-lease reclamation.
//!
//! A lease has no heartbeat. It is considered abandoned when the leased
//! document has not been touched for long enough:
//! 1. held by a different code version and untouched for `old_version_timeout`
//!    (a deploy replaced the process that leased it);
//! 2. held by anyone and untouched for `old_version_timeout + cur_version_timeout`.
//!
//! Reclaiming releases the lease (owner and version) so the connector picks the
//! item up again. The store stamps `last_updated_time` on the release, so a
//! second sweep right after finds nothing.

use chrono::{DateTime, Utc};

use crate::domain::CodeVersion;
use crate::error::StoreError;
use crate::ports::{ItemFilter, ItemPatch, ItemStore};
use crate::queue::QueueConfig;

/// Release every stale lease. Returns how many documents were released.
pub async fn reclaim_stale_leases(
    store: &dyn ItemStore,
    running_version: &CodeVersion,
    config: &QueueConfig,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let release = ItemPatch::release();

    let other_version = ItemFilter::leased()
        .with_lease_version_not(running_version.clone())
        .updated_before(now - config.old_version_timeout());
    let from_old_versions = store.update_many(&other_version, &release).await?;

    let any_version = ItemFilter::leased()
        .updated_before(now - config.old_version_timeout() - config.cur_version_timeout());
    let from_any_version = store.update_many(&any_version, &release).await?;

    Ok(from_old_versions + from_any_version)
}

//! Queue policy building blocks: ordering policies, sort-index sequence,
//! retry backoff and configuration.

mod backoff;
mod config;
mod policy;
mod sequence;

pub use backoff::Backoff;
pub use config::{ENV_PREFIX, QueueConfig};
pub use policy::{OrderingPolicy, StrictKeyOrder, UniqueKey};
pub use sequence::SortIndexSequence;

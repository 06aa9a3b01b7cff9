//! App - the queue engine built from ports and queue policies.
//!
//! # Components
//! - **Queue**: facade for producers and the owning application
//! - **Connector**: single dispatcher leasing items for free channels
//! - **WorkerChannel**: consume state machine for one item at a time
//! - **reclaim_stale_leases**: releases leases nobody is working on
//! - **ConsumerRegistry**: topic -> consumer binding

mod channel;
mod connector;
pub mod facade;
pub mod reaper;
pub mod registry;
pub mod status;

pub use self::channel::Outcome;
pub use self::facade::Queue;
pub use self::reaper::reclaim_stale_leases;
pub use self::registry::{Consumer, ConsumerRegistry, FnConsumer, consumer_fn};
pub use self::status::QueueCounts;

//! docq-core
//!
//! Durable work queues over a document store.
//!
//! # Modules
//! - **domain**: item document, ids, topics, lease identity
//! - **ports**: `ItemStore` and `Clock` abstractions
//! - **impls**: in-memory `ItemStore`
//! - **queue**: ordering policies, sort-index sequence, backoff, config
//! - **app**: queue facade, connector, worker channels, reclamation
//! - **error**: error types
//! - **observability**: tracing setup
//!
//! # Example
//! ```ignore
//! let queue = Queue::in_memory("transfers", StrictKeyOrder, QueueConfig::from_env()?);
//! queue.init().await?;
//! queue.set_consumer(consumer_fn(|item| async move { apply(item.decode()?).await }))?;
//! queue.push(json!({"amount": 10}), "account-1").await?;
//! queue.start_consuming()?;
//! ```

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use app::{Consumer, Queue, QueueCounts, consumer_fn};
pub use domain::{QueueItem, Topic};
pub use error::{ConfigError, ConsumeError, QueueError, StoreError};
pub use queue::{QueueConfig, StrictKeyOrder, UniqueKey};

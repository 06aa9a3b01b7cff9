//! ConsumerRegistry - topic と Consumer の対応付け
//!
//! 起動前は `&mut` で登録し、`start_consuming` で `Arc` に固めて各 channel と共有する。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{QueueItem, Topic};
use crate::error::{ConsumeError, QueueError};

/// Application code that processes one item.
///
/// Called from up to `channel_count` worker channels at once, so
/// implementations must be safe to share.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, item: &QueueItem) -> Result<(), ConsumeError>;
}

/// Adapter turning an async closure into a [`Consumer`].
pub struct FnConsumer<F> {
    f: F,
}

/// Wrap `f` as a consumer. The closure receives its own copy of the item.
///
/// ```ignore
/// queue.set_consumer(consumer_fn(|item| async move {
///     let transfer: Transfer = item.decode()?;
///     apply(transfer).await
/// }))?;
/// ```
pub fn consumer_fn<F, Fut>(f: F) -> FnConsumer<F>
where
    F: Fn(QueueItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
    FnConsumer { f }
}

#[async_trait]
impl<F, Fut> Consumer for FnConsumer<F>
where
    F: Fn(QueueItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
    async fn consume(&self, item: &QueueItem) -> Result<(), ConsumeError> {
        (self.f)(item.clone()).await
    }
}

/// Consumers bound to a queue.
///
/// Built while the queue is idle, then frozen into an `Arc` when consuming
/// starts. In single-consumer mode the one consumer handles every item
/// whatever its topic.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<Topic, Arc<dyn Consumer>>,
    single: bool,
}

impl ConsumerRegistry {
    /// Registry routing items by topic.
    pub fn by_topic() -> Self {
        Self::default()
    }

    /// Registry holding exactly one consumer on the default topic.
    pub fn single() -> Self {
        Self {
            consumers: HashMap::new(),
            single: true,
        }
    }

    /// Bind `consumer` to `topic`. A later registration for the same topic
    /// replaces the earlier one.
    pub fn register(
        &mut self,
        topic: Topic,
        consumer: Arc<dyn Consumer>,
        policy_name: &str,
    ) -> Result<(), QueueError> {
        if self.single && (!topic.is_default() || !self.consumers.is_empty()) {
            return Err(QueueError::TopicRoutingUnsupported(policy_name.to_string()));
        }
        self.consumers.insert(topic, consumer);
        Ok(())
    }

    /// Consumer for an item on `topic`.
    pub fn route(&self, topic: &Topic) -> Option<Arc<dyn Consumer>> {
        if self.single {
            return self.consumers.values().next().cloned();
        }
        self.consumers.get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.consumers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

//! Queue facade: the API producers and the owning application use.
//!
//! # Lifecycle
//! ```text
//! new -> init -> (push ...) -> register consumers -> start_consuming -> shutdown
//! ```
//! - `init` creates indexes and marks the queue ready; pushes fail before it.
//! - Consumers are registered while idle; the registry is frozen at start.
//! - `shutdown` stops leasing; items already handed to a channel finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::channel::{ChannelContext, ChannelSlot, WorkerChannel};
use super::connector::{ChannelHandle, Connector};
use super::registry::{Consumer, ConsumerRegistry};
use super::status::QueueCounts;
use crate::domain::{CodeVersion, QueueItem, Topic, host_identity};
use crate::error::QueueError;
use crate::impls::InMemoryItemStore;
use crate::ports::{Clock, IndexField, IndexSpec, ItemFilter, ItemStore, SystemClock};
use crate::queue::{OrderingPolicy, QueueConfig, SortIndexSequence};

/// Handles of a started queue.
struct Running {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

/// A durable work queue over a document store, parameterized by its ordering
/// policy.
pub struct Queue<P: OrderingPolicy> {
    name: String,
    policy: Arc<P>,
    pending: Arc<dyn ItemStore>,
    consumed: Arc<dyn ItemStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    version: CodeVersion,
    host: String,
    sequence: SortIndexSequence,
    ready: AtomicBool,
    started: AtomicBool,
    consumers: Mutex<ConsumerRegistry>,
    running: Mutex<Option<Running>>,
}

impl<P: OrderingPolicy> Queue<P> {
    /// A queue over the given pending and consumed collections. `config` is
    /// normalized.
    pub fn new(
        name: impl Into<String>,
        policy: P,
        pending: Arc<dyn ItemStore>,
        consumed: Arc<dyn ItemStore>,
        config: QueueConfig,
    ) -> Self {
        let consumers = if policy.routes_by_topic() {
            ConsumerRegistry::by_topic()
        } else {
            ConsumerRegistry::single()
        };
        Self {
            name: name.into(),
            policy: Arc::new(policy),
            pending,
            consumed,
            config: config.normalized(),
            clock: Arc::new(SystemClock),
            version: CodeVersion::from_env(),
            host: host_identity(),
            sequence: SortIndexSequence::new(),
            ready: AtomicBool::new(false),
            started: AtomicBool::new(false),
            consumers: Mutex::new(consumers),
            running: Mutex::new(None),
        }
    }

    /// A queue over two fresh in-memory collections.
    pub fn in_memory(name: impl Into<String>, policy: P, config: QueueConfig) -> Self {
        Self::new(
            name,
            policy,
            Arc::new(InMemoryItemStore::new()),
            Arc::new(InMemoryItemStore::new()),
            config,
        )
    }

    /// Use `clock` for failure timestamps, backoff and reclamation.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the running code version (defaults to `DOCQ_VERSION`).
    pub fn with_version(mut self, version: CodeVersion) -> Self {
        self.version = version;
        self
    }

    /// Override the host part of channel and connector names (defaults to
    /// `HOSTNAME`).
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &CodeVersion {
        &self.version
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Create the indexes both collections need and mark the queue ready.
    pub async fn init(&self) -> Result<(), QueueError> {
        let mut pending_indexes = vec![
            IndexSpec::new([IndexField::LeaseOwner]),
            IndexSpec::new([IndexField::Keys]),
        ];
        pending_indexes.extend(self.policy.pending_indexes());
        for index in pending_indexes {
            self.pending.ensure_index(index).await?;
        }

        self.consumed
            .ensure_index(
                IndexSpec::new([IndexField::LastUpdatedTime]).expire_after(self.config.history_ttl()),
            )
            .await?;
        self.consumed
            .ensure_index(IndexSpec::new([IndexField::OrderingKey]))
            .await?;

        self.ready.store(true, Ordering::Release);
        info!(queue = %self.name, policy = self.policy.name(), "queue initialized");
        Ok(())
    }

    /// Push `data` under `ordering_key` on the default topic.
    pub async fn push(
        &self,
        data: serde_json::Value,
        ordering_key: impl Into<String>,
    ) -> Result<QueueItem, QueueError> {
        self.push_with_keys_and_topic(data, ordering_key, None, Topic::default())
            .await
    }

    /// Push with secondary lookup tags.
    pub async fn push_with_keys(
        &self,
        data: serde_json::Value,
        ordering_key: impl Into<String>,
        keys: Option<Vec<String>>,
    ) -> Result<QueueItem, QueueError> {
        self.push_with_keys_and_topic(data, ordering_key, keys, Topic::default())
            .await
    }

    /// Push with tags onto a topic. Returns the stored item.
    pub async fn push_with_keys_and_topic(
        &self,
        data: serde_json::Value,
        ordering_key: impl Into<String>,
        keys: Option<Vec<String>>,
        topic: Topic,
    ) -> Result<QueueItem, QueueError> {
        if !self.is_ready() {
            return Err(QueueError::NotInitialized);
        }

        let sort_index = self.policy.assigns_sort_index().then(|| {
            let now = self.clock.now();
            // timestamp_nanos_opt is None only past the year 2262
            let nanos = now
                .timestamp_nanos_opt()
                .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000));
            self.sequence.next(nanos)
        });

        let item = QueueItem::new(data, ordering_key)
            .with_keys(keys)
            .with_topic(topic)
            .with_sort_index(sort_index);
        let stored = self.pending.insert(item).await?;
        debug!(queue = %self.name, key = %stored.ordering_key, sort_index = ?stored.sort_index, "item pushed");
        Ok(stored)
    }

    /// Bind `consumer` to `topic`.
    pub fn register_consumer<C>(&self, topic: Topic, consumer: C) -> Result<(), QueueError>
    where
        C: Consumer + 'static,
    {
        if self.started.load(Ordering::Acquire) {
            return Err(QueueError::AlreadyStarted);
        }
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        consumers.register(topic, Arc::new(consumer), self.policy.name())
    }

    /// Bind `consumer` to the default topic.
    pub fn set_consumer<C>(&self, consumer: C) -> Result<(), QueueError>
    where
        C: Consumer + 'static,
    {
        self.register_consumer(Topic::default(), consumer)
    }

    /// Spawn the worker channels and the connector on the current tokio
    /// runtime.
    pub fn start_consuming(&self) -> Result<(), QueueError> {
        if !self.is_ready() {
            return Err(QueueError::NotInitialized);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyStarted);
        }

        let consumers = self
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let ctx = Arc::new(ChannelContext {
            policy: Arc::clone(&self.policy),
            pending: Arc::clone(&self.pending),
            consumed: Arc::clone(&self.consumed),
            consumers: Arc::new(consumers),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(self.config.channel_count + 1);
        let mut handles = Vec::with_capacity(self.config.channel_count);
        for n in 1..=self.config.channel_count {
            let slot = Arc::new(ChannelSlot::new(format!("{}/{n}", self.host)));
            let (tx, rx) = mpsc::channel(1);
            let channel = WorkerChannel::new(Arc::clone(&slot), Arc::clone(&ctx));
            joins.push(tokio::spawn(channel.run(rx)));
            handles.push(ChannelHandle { slot, tx });
        }

        let connector = Connector::new(
            format!("{}/connector", self.host),
            self.version.clone(),
            handles,
            ctx,
        );
        joins.push(tokio::spawn(connector.run(shutdown_rx)));

        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(Running { shutdown_tx, joins });
        info!(queue = %self.name, channels = self.config.channel_count, "consuming started");
        Ok(())
    }

    /// Stop leasing new items. Items already handed to a channel finish.
    pub fn shutdown(&self) {
        if let Some(running) = self.running.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            // ignore send error: the connector may already be gone
            let _ = running.shutdown_tx.send(true);
        }
    }

    /// Shut down and wait for the connector and every channel to exit.
    pub async fn shutdown_and_join(&self) {
        self.shutdown();
        let joins = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .map(|running| std::mem::take(&mut running.joins))
            .unwrap_or_default();
        for join in joins {
            let _ = join.await;
        }
        info!(queue = %self.name, "queue stopped");
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let pending = self.pending.count(&ItemFilter::default()).await?;
        let leased = self.pending.count(&ItemFilter::leased()).await?;
        let consumed = self.consumed.count(&ItemFilter::default()).await?;
        Ok(QueueCounts {
            pending,
            leased,
            unleased: pending.saturating_sub(leased),
            consumed,
        })
    }

    /// Archived copies of items consumed under `ordering_key`, oldest first.
    pub async fn consumed_history(&self, ordering_key: &str) -> Result<Vec<QueueItem>, QueueError> {
        let filter = ItemFilter::default().with_ordering_key(ordering_key);
        Ok(self.consumed.find(&filter, usize::MAX).await?)
    }
}

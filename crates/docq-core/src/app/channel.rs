//! WorkerChannel - lease 済み item を 1 つずつ処理するワーカー
//!
//! ```text
//! Received -> (backoff) -> OrderCheck -> Processing -> Success | Failure
//! ```
//!
//! - 成功: pending から削除し、consumed にコピーを保存
//! - 失敗: log に 1 行追記して lease をその場で解放する。log が満杯なら
//!   新しいドキュメントとして repush する
//!
//! # repush の順序
//! unique index が無ければ insert してから delete する。unique index がある場合は
//! delete が先になるので、insert に失敗したら元の item を書き戻す。
//! どちらの場合も item が pending から消えることはない。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::registry::ConsumerRegistry;
use crate::domain::QueueItem;
use crate::error::{ConsumeError, StoreError};
use crate::ports::{Clock, ItemFilter, ItemPatch, ItemStore};
use crate::queue::{OrderingPolicy, QueueConfig};

const REPUSH_ATTEMPTS: u32 = 3;
const LOG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Everything a channel needs besides its own name. Shared by all channels
/// of one queue.
pub(crate) struct ChannelContext<P> {
    pub policy: Arc<P>,
    pub pending: Arc<dyn ItemStore>,
    pub consumed: Arc<dyn ItemStore>,
    pub consumers: Arc<ConsumerRegistry>,
    pub config: QueueConfig,
    pub clock: Arc<dyn Clock>,
}

/// The connector's view of a channel: its name and whether it is busy.
#[derive(Debug)]
pub(crate) struct ChannelSlot {
    name: String,
    processing: AtomicBool,
}

impl ChannelSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark busy. Fails if the channel already holds an item.
    pub fn try_claim(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.processing.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }
}

/// What happened to an item handed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Consumed, removed from pending and archived.
    Consumed,
    /// Failed; the item stays pending, unleased, for a later retry.
    Retry,
    /// Failed with a full log; reinserted as a fresh document.
    Repushed,
    /// The store rejected the outcome write; the lease stays until reclaimed.
    Abandoned,
}

pub(crate) struct WorkerChannel<P> {
    slot: Arc<ChannelSlot>,
    ctx: Arc<ChannelContext<P>>,
}

impl<P: OrderingPolicy> WorkerChannel<P> {
    pub fn new(slot: Arc<ChannelSlot>, ctx: Arc<ChannelContext<P>>) -> Self {
        Self { slot, ctx }
    }

    /// Handle items until the connector drops its sender.
    pub async fn run(self, mut rx: mpsc::Receiver<QueueItem>) {
        while let Some(item) = rx.recv().await {
            self.handle(item).await;
            self.slot.release();
        }
        debug!(channel = %self.slot.name(), "channel stopped");
    }

    /// Take one leased item through the state machine.
    pub async fn handle(&self, item: QueueItem) -> Outcome {
        self.wait_for_retry(&item).await;

        let started = Instant::now();
        let result = self.process(&item).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => self.on_success(item, elapsed).await,
            Err(err) => self.on_failure(item, err).await,
        }
    }

    /// Back off when the item failed recently.
    async fn wait_for_retry(&self, item: &QueueItem) {
        let Some(last_fail) = item.last_fail_time else {
            return;
        };
        if self.ctx.clock.now() - last_fail >= self.ctx.config.maximum_wait_to_retry() {
            return;
        }
        let delay = self.ctx.config.backoff.delay(item.log.len().max(1));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn process(&self, item: &QueueItem) -> Result<(), ConsumeError> {
        let eligible = self
            .ctx
            .policy
            .is_eligible(item, self.ctx.pending.as_ref())
            .await
            .map_err(|e| ConsumeError::failed(format!("order check: {e}")))?;
        if !eligible {
            return Err(ConsumeError::WrongOrder);
        }

        let consumer = self
            .ctx
            .consumers
            .route(&item.topic)
            .ok_or_else(|| ConsumeError::ConsumerNotReady(item.topic.clone()))?;
        consumer.consume(item).await
    }

    async fn on_success(&self, item: QueueItem, elapsed: Duration) -> Outcome {
        let Some(id) = item.id else {
            error!(channel = %self.slot.name(), "consumed item has no id");
            return Outcome::Abandoned;
        };

        if let Err(e) = self.ctx.pending.delete(id).await {
            error!(channel = %self.slot.name(), item = %id, error = %e, "failed to remove consumed item");
            return Outcome::Abandoned;
        }

        let process_time_ms = elapsed.as_millis() as u64;
        if let Err(e) = self.ctx.consumed.insert(item.archived(process_time_ms)).await {
            error!(channel = %self.slot.name(), item = %id, error = %e, "failed to archive consumed item");
        }

        debug!(
            channel = %self.slot.name(),
            item = %id,
            key = %item.ordering_key,
            process_time_ms,
            "item consumed"
        );
        Outcome::Consumed
    }

    async fn on_failure(&self, mut item: QueueItem, err: ConsumeError) -> Outcome {
        let now = self.ctx.clock.now();
        let line = format!("{} {} {}", self.slot.name(), now.format(LOG_TIME_FORMAT), err);
        if err.is_counted() {
            item.fail_count += 1;
        }
        let repush = item.push_failure_log(line, self.ctx.config.log_size);

        warn!(
            channel = %self.slot.name(),
            key = %item.ordering_key,
            fail_count = item.fail_count,
            repush,
            error = %err,
            "consume failed"
        );

        let applied = if repush {
            self.repush(&item, now).await
        } else {
            self.release_for_retry(&item, now).await.map(|_| Outcome::Retry)
        };

        applied.unwrap_or_else(|e| {
            error!(channel = %self.slot.name(), key = %item.ordering_key, error = %e, "failed to record failure");
            Outcome::Abandoned
        })
    }

    async fn release_for_retry(
        &self,
        item: &QueueItem,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        let Some(id) = item.id else {
            return Err(StoreError::Backend("failed item has no id".into()));
        };
        let patch = ItemPatch {
            log: Some(item.log.clone()),
            last_fail_time: Some(now),
            fail_count: Some(item.fail_count),
            ..ItemPatch::release()
        };
        self.ctx
            .pending
            .find_one_and_update(&ItemFilter::by_id(id), &patch)
            .await?;
        Ok(())
    }

    /// Replace the failed document with a fresh copy.
    ///
    /// Without a unique index the copy goes in before the old document is
    /// deleted, and a failed insert falls back to releasing the lease in
    /// place. Under a unique index the old document has to go first; if the
    /// copy cannot be inserted the original is put back unleased.
    async fn repush(
        &self,
        item: &QueueItem,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Outcome, StoreError> {
        let Some(id) = item.id else {
            return Err(StoreError::Backend("failed item has no id".into()));
        };
        let fresh = item.repushed(now);

        if !self.ctx.policy.requires_unique_key() {
            if let Err(e) = self.insert_with_retry(fresh).await {
                warn!(channel = %self.slot.name(), item = %id, error = %e, "repush insert failed, releasing in place");
                self.release_for_retry(item, now).await?;
                return Ok(Outcome::Retry);
            }
            self.ctx.pending.delete(id).await?;
            return Ok(Outcome::Repushed);
        }

        self.ctx.pending.delete(id).await?;
        match self.insert_with_retry(fresh).await {
            Ok(()) => Ok(Outcome::Repushed),
            Err(e) => {
                warn!(channel = %self.slot.name(), item = %id, error = %e, "repush insert failed, restoring original");
                let mut original = item.clone();
                original.lease_owner = None;
                original.lease_version = None;
                original.last_fail_time = Some(now);
                self.insert_with_retry(original).await?;
                Ok(Outcome::Retry)
            }
        }
    }

    async fn insert_with_retry(&self, item: QueueItem) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.ctx.pending.insert(item.clone()).await {
                Ok(_) => return Ok(()),
                Err(e @ StoreError::DuplicateKey { .. }) => return Err(e),
                Err(e) if attempt >= REPUSH_ATTEMPTS => return Err(e),
                Err(e) => {
                    debug!(channel = %self.slot.name(), attempt, error = %e, "insert failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.ctx.config.backoff.delay(attempt as usize)).await;
                }
            }
        }
    }
}

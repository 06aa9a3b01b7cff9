//! Connector: the single dispatcher task of a queue.
//!
//! Loop:
//! 1. pick a free channel, round-robin, starting after the last pick;
//! 2. lease one unleased item for it with a single atomic store update;
//! 3. hand the item to the channel, or sleep `selector_delay` when there is
//!    nothing to lease;
//! 4. every `reclaim_every` iterations, release stale leases.
//!
//! On shutdown the connector returns and drops its senders; each channel then
//! finishes the item it holds and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::channel::{ChannelContext, ChannelSlot};
use super::reaper::reclaim_stale_leases;
use crate::domain::{CodeVersion, LeaseOwner, QueueItem, Topic};
use crate::ports::{ItemFilter, ItemPatch};
use crate::queue::OrderingPolicy;

const ALL_BUSY_PAUSE: Duration = Duration::from_millis(10);

/// Sending half of one channel, as seen by the connector.
pub(crate) struct ChannelHandle {
    pub slot: Arc<ChannelSlot>,
    pub tx: mpsc::Sender<QueueItem>,
}

pub(crate) struct Connector<P> {
    name: String,
    version: CodeVersion,
    channels: Vec<ChannelHandle>,
    ctx: Arc<ChannelContext<P>>,
    /// `None` leases any topic.
    topics: Option<Vec<Topic>>,
    next: usize,
}

impl<P: OrderingPolicy> Connector<P> {
    pub fn new(
        name: impl Into<String>,
        version: CodeVersion,
        channels: Vec<ChannelHandle>,
        ctx: Arc<ChannelContext<P>>,
    ) -> Self {
        let topics = ctx
            .policy
            .routes_by_topic()
            .then(|| ctx.consumers.topics());
        Self {
            name: name.into(),
            version,
            channels,
            ctx,
            topics,
            next: 0,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            connector = %self.name,
            policy = self.ctx.policy.name(),
            version = %self.version,
            channels = self.channels.len(),
            "connector starting"
        );
        if !idle(self.ctx.config.startup_delay(), &mut shutdown_rx).await {
            return;
        }

        let reclaim_every = u64::from(self.ctx.config.reclaim_every.max(1));
        let mut iteration: u64 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            iteration += 1;
            if iteration % reclaim_every == 0 {
                self.reclaim().await;
            }

            let Some(index) = self.pick_free_channel() else {
                if !idle(ALL_BUSY_PAUSE, &mut shutdown_rx).await {
                    break;
                }
                continue;
            };

            if !self.dispatch(index).await
                && !idle(self.ctx.config.selector_delay(), &mut shutdown_rx).await
            {
                break;
            }
        }

        info!(connector = %self.name, "connector stopped");
        // dropping `self.channels` closes every channel's receiver
    }

    /// Claim the next free channel after the last pick.
    fn pick_free_channel(&mut self) -> Option<usize> {
        let n = self.channels.len();
        for offset in 0..n {
            let index = (self.next + offset) % n;
            if self.channels[index].slot.try_claim() {
                self.next = (index + 1) % n;
                return Some(index);
            }
        }
        None
    }

    /// Lease one item for channel `index`. Returns whether an item was handed
    /// over; otherwise the channel is released again.
    async fn dispatch(&self, index: usize) -> bool {
        let channel = &self.channels[index];

        let mut filter = ItemFilter::unleased();
        if let Some(topics) = &self.topics {
            filter = filter.with_topics(topics.clone());
        }
        let patch = ItemPatch::acquire(
            LeaseOwner::for_channel(&self.name, channel.slot.name()),
            self.version.clone(),
        );

        let item = match self.ctx.pending.find_one_and_update(&filter, &patch).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                channel.slot.release();
                return false;
            }
            Err(e) => {
                warn!(connector = %self.name, error = %e, "lease query failed");
                channel.slot.release();
                return false;
            }
        };

        debug!(channel = %channel.slot.name(), key = %item.ordering_key, "item leased");
        if let Err(e) = channel.tx.try_send(item) {
            channel.slot.release();
            let item = match e {
                mpsc::error::TrySendError::Full(item) | mpsc::error::TrySendError::Closed(item) => item,
            };
            warn!(channel = %channel.slot.name(), key = %item.ordering_key, "handoff failed, releasing lease");
            if let Some(id) = item.id
                && let Err(e) = self
                    .ctx
                    .pending
                    .find_one_and_update(&ItemFilter::by_id(id), &ItemPatch::release())
                    .await
            {
                warn!(item = %id, error = %e, "could not release lease; left for reclamation");
            }
            return false;
        }
        true
    }

    async fn reclaim(&self) {
        let now = self.ctx.clock.now();
        match reclaim_stale_leases(self.ctx.pending.as_ref(), &self.version, &self.ctx.config, now).await {
            Ok(0) => {}
            Ok(n) => info!(connector = %self.name, reclaimed = n, "released stale leases"),
            Err(e) => warn!(connector = %self.name, error = %e, "stale lease reclamation failed"),
        }
    }
}

/// Sleep for `d` unless shutdown is requested first. Returns `false` on
/// shutdown.
async fn idle(d: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    if d.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(d) => true,
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
    }
}

//! docq demo: pushes transfers into an in-memory queue and consumes them.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::time::{Duration, Instant, sleep};
use tracing::info;

use docq_core::observability::init_tracing;
use docq_core::queue::OrderingPolicy;
use docq_core::{
    ConsumeError, Consumer, Queue, QueueConfig, QueueItem, StrictKeyOrder, UniqueKey,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Same-key items are consumed oldest-first
    Strict,
    /// At most one pending item per key
    Unique,
}

#[derive(Parser)]
#[command(name = "docq", about = "Run a document-store queue against an in-memory store")]
struct Cli {
    /// Ordering policy
    #[arg(long, value_enum, default_value_t = Mode::Strict)]
    mode: Mode,
    /// Items to push
    #[arg(long, default_value_t = 20)]
    items: u32,
    /// Distinct ordering keys (strict mode)
    #[arg(long, default_value_t = 4)]
    keys: u32,
    /// Worker channels (overrides DOCQ_CHANNEL_COUNT)
    #[arg(long)]
    channels: Option<usize>,
    /// Fail this many consume attempts before succeeding
    #[arg(long, default_value_t = 2)]
    fail_first: u32,
    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_s: u64,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    seq: u32,
    amount: u64,
}

struct TransferConsumer {
    remaining_failures: AtomicU32,
}

impl TransferConsumer {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }

    /// Count down one intentional failure; `Err` once none are left.
    fn take_failure(&self) -> Result<u32, u32> {
        self.remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
    }
}

#[async_trait]
impl Consumer for TransferConsumer {
    async fn consume(&self, item: &QueueItem) -> Result<(), ConsumeError> {
        let transfer: Transfer = item.decode()?;

        if let Ok(left) = self.take_failure() {
            return Err(ConsumeError::failed(format!(
                "intentional failure (left={left})"
            )));
        }

        sleep(Duration::from_millis(20)).await;
        info!(key = %item.ordering_key, seq = transfer.seq, amount = transfer.amount, "transfer applied");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = QueueConfig::from_env()?;
    if let Some(channels) = cli.channels {
        config.channel_count = channels;
    }

    match cli.mode {
        Mode::Strict => run(Queue::in_memory("transfers", StrictKeyOrder, config), &cli).await,
        Mode::Unique => run(Queue::in_memory("transfers", UniqueKey, config), &cli).await,
    }
}

async fn run<P: OrderingPolicy>(queue: Queue<P>, cli: &Cli) -> anyhow::Result<()> {
    queue.init().await?;
    queue.set_consumer(TransferConsumer::new(cli.fail_first))?;

    for seq in 0..cli.items {
        let key = match cli.mode {
            Mode::Strict => format!("account-{}", seq % cli.keys.max(1)),
            Mode::Unique => format!("job-{seq}"),
        };
        let data = serde_json::json!({ "seq": seq, "amount": 100 + u64::from(seq) });
        queue.push(data, key).await?;
    }
    info!(items = cli.items, version = %queue.version(), "items pushed");

    queue.start_consuming()?;
    let deadline = Instant::now() + Duration::from_secs(cli.timeout_s);

    loop {
        let counts = queue.counts().await?;
        if counts.is_drained() {
            info!(consumed = counts.consumed, "queue drained");
            break;
        }
        if Instant::now() >= deadline {
            info!(pending = counts.pending, leased = counts.leased, "timed out");
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = sleep(Duration::from_millis(250)) => {}
        }
    }

    queue.shutdown_and_join().await;
    let counts = queue.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

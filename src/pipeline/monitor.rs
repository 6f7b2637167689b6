use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::PipelineError;
use crate::rpc::ChainClient;
use crate::store::{BlockSet, TaskStore};

/// Numbers examined per parallel gap-fill batch.
const GAP_FILL_BATCH: u64 = 100_000;

/// Ticks the producer may lag behind the chain tip before it is reported
/// unhealthy.
const LAG_GRACE_TICKS: u32 = 2;

/// Periodic repair loop: rebuilds ALL, requeues stuck claims, fills
/// numeric gaps and watches producer liveness. Each tick is isolated;
/// a failed tick logs and yields to the next one.
pub struct Monitor<S, C> {
    store: Arc<S>,
    chain: Arc<C>,
    health: watch::Sender<bool>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<S: TaskStore, C: ChainClient> Monitor<S, C> {
    pub fn new(
        store: Arc<S>,
        chain: Arc<C>,
        health: watch::Sender<bool>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            chain,
            health,
            interval,
            cancel,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut lagging_ticks = 0u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_once(&mut lagging_ticks).await {
                tracing::error!("monitor tick failed: {}", e);
            }
        }
    }

    pub(crate) async fn run_once(&self, lagging_ticks: &mut u32) -> Result<(), PipelineError> {
        self.redistribute().await?;
        let max_known = self.fill_gaps().await?;
        self.check_producer(max_known, lagging_ticks).await?;
        Ok(())
    }

    /// ALL becomes the union of the three lifecycle sets, everything stuck
    /// in-flight goes back to pending, and pending is recomputed as the
    /// difference.
    pub(crate) async fn redistribute(&self) -> Result<(), PipelineError> {
        let total = self.store.union_all().await?;
        if total == 0 {
            tracing::debug!("task queue is empty, nothing to redistribute");
            return Ok(());
        }
        self.store.requeue_stale().await?;
        self.store.diff_repair().await?;
        Ok(())
    }

    /// Make ALL contiguous between its bounds. Batches run in parallel and
    /// join before pending is recomputed. Returns the highest known number.
    pub(crate) async fn fill_gaps(&self) -> Result<Option<u64>, PipelineError> {
        let mut numbers = self.store.block_numbers(BlockSet::All).await?;
        if numbers.is_empty() {
            return Ok(None);
        }
        numbers.sort_unstable();
        let first = numbers[0];
        let last = numbers[numbers.len() - 1];
        let known: Arc<HashSet<u64>> = Arc::new(numbers.into_iter().collect());

        let mut batches = Vec::new();
        let mut start = first;
        while start <= last {
            let end = std::cmp::min(start.saturating_add(GAP_FILL_BATCH - 1), last);
            let store = Arc::clone(&self.store);
            let known = Arc::clone(&known);
            batches.push(tokio::spawn(fill_batch(store, known, start, end)));
            start = end.saturating_add(1);
        }

        let mut filled = 0u64;
        for batch in batches {
            filled += batch
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))??;
        }

        if filled > 0 {
            tracing::info!("filled {} gaps in [{}, {}]", filled, first, last);
            self.store.diff_repair().await?;
        }
        Ok(Some(last))
    }

    /// The producer is healthy while `max(ALL)` keeps up with the chain
    /// tip. Two consecutive lagging ticks flip the health signal.
    pub(crate) async fn check_producer(
        &self,
        max_known: Option<u64>,
        lagging_ticks: &mut u32,
    ) -> Result<(), PipelineError> {
        let tip = self.chain.latest_block_number().await?;
        let behind = match max_known {
            Some(max) => max < tip,
            None => tip > 0,
        };

        if behind {
            *lagging_ticks += 1;
        } else {
            *lagging_ticks = 0;
        }

        let healthy = *lagging_ticks < LAG_GRACE_TICKS;
        if !healthy {
            tracing::warn!(
                "producer lagging: max known block {:?}, chain tip {}",
                max_known,
                tip
            );
        }
        self.health.send_if_modified(|current| {
            if *current != healthy {
                *current = healthy;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

async fn fill_batch<S: TaskStore>(
    store: Arc<S>,
    known: Arc<HashSet<u64>>,
    start: u64,
    end: u64,
) -> Result<u64, PipelineError> {
    let missing: Vec<u64> = (start..=end).filter(|n| !known.contains(n)).collect();
    if missing.is_empty() {
        return Ok(0);
    }
    store.add_to_set(BlockSet::All, &missing).await?;
    Ok(missing.len() as u64)
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::PipelineError;
use crate::db::Database;
use crate::store::{BlockSet, TaskStore};

/// Rows pulled from the database when rebuilding the task queue.
const RECENT_RELOAD_ROWS: i64 = 10_000;

/// Single-instance materializer: moves consumed block numbers and buffered
/// transaction records from the shared store into the database, then prunes
/// the flushed keys. Each tick is isolated; failures log and yield to the
/// next tick.
pub struct Flusher<S, D> {
    store: Arc<S>,
    db: Arc<D>,
    interval: Duration,
    tx_batch_size: usize,
    // Scan position survives across ticks; only one flusher runs, so
    // process-local is enough.
    cursor: AtomicU64,
    cancel: CancellationToken,
}

impl<S: TaskStore, D: Database> Flusher<S, D> {
    pub fn new(
        store: Arc<S>,
        db: Arc<D>,
        interval: Duration,
        tx_batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            db,
            interval,
            tx_batch_size,
            cursor: AtomicU64::new(0),
            cancel,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("flusher stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.flush_blocks().await {
                tracing::error!("block flush failed: {}", e);
            }
            if let Err(e) = self.flush_transactions().await {
                tracing::error!("transaction flush failed: {}", e);
            }
        }
    }

    /// Persist the consumed range once everything known is consumed and
    /// contiguous. Skipping is normal: the monitor keeps repairing until a
    /// later pass qualifies.
    pub(crate) async fn flush_blocks(&self) -> Result<bool, PipelineError> {
        let all = self.store.block_numbers(BlockSet::All).await?;
        if all.is_empty() {
            return Ok(false);
        }
        let mut consumed = self.store.block_numbers(BlockSet::Consumed).await?;
        if all.len() != consumed.len() {
            return Ok(false);
        }
        consumed.sort_unstable();
        let first = consumed[0];
        let last = consumed[consumed.len() - 1];
        if last - first + 1 != consumed.len() as u64 {
            let missing = (last - first + 1) - consumed.len() as u64;
            tracing::info!(
                "consumed set has {} holes in [{}, {}], skipping block flush",
                missing,
                first,
                last
            );
            return Ok(false);
        }

        self.db.upsert_block_range(first, last, true).await?;
        self.store.remove_flushed(first, last).await?;
        tracing::info!("flushed block numbers {} to {}", first, last);
        Ok(true)
    }

    /// Drain one page of the transaction buffer into the database. The
    /// hashes are deleted only after the upsert committed, so a crash
    /// between the two replays harmlessly.
    pub(crate) async fn flush_transactions(&self) -> Result<usize, PipelineError> {
        let cursor = self.cursor.load(Ordering::Relaxed);
        let (records, next_cursor) = self.store.scan_txs(cursor, self.tx_batch_size).await?;
        if records.is_empty() {
            self.cursor.store(0, Ordering::Relaxed);
            return Ok(0);
        }

        self.db.upsert_transactions(&records).await?;

        let hashes: Vec<String> = records.iter().map(|r| r.hash.clone()).collect();
        self.store.delete_txs(&hashes).await?;
        self.cursor.store(next_cursor, Ordering::Relaxed);

        tracing::info!("flushed {} transactions", records.len());
        Ok(records.len())
    }

    /// Startup reconciliation: make the database and the store agree on
    /// which side is authoritative, then rebuild the task queue from the
    /// newest rows and repair any holes left by past crashes.
    pub(crate) async fn reconcile(&self) -> Result<(), PipelineError> {
        let all = self.store.block_numbers(BlockSet::All).await?;
        let store_max = all.iter().max().copied();
        let store_min = all.iter().min().copied();
        let db_max = self.db.max_block_number().await?;

        match (db_max, store_max) {
            (Some(db_max), Some(store_max)) if db_max >= store_max => {
                tracing::info!(
                    "database is ahead of the store ({} >= {}), rebuilding queue from it",
                    db_max,
                    store_max
                );
                self.reload_from_db(false).await?;
            }
            (_, Some(store_max)) => {
                let from = db_max.unwrap_or_else(|| store_min.unwrap_or(store_max));
                tracing::info!(
                    "store is ahead of the database, backfilling rows {} to {}",
                    from,
                    store_max
                );
                self.db.upsert_block_range(from, store_max, false).await?;
                let consumed = self.store.block_numbers(BlockSet::Consumed).await?;
                self.db.mark_blocks_consumed(&consumed).await?;
                self.reload_from_db(true).await?;
            }
            (Some(_), None) => {
                self.reload_from_db(false).await?;
            }
            (None, None) => {
                tracing::info!("database and store are both empty, fresh start");
            }
        }

        let repaired = self.db.repair_block_gaps().await?;
        if repaired > 0 {
            tracing::info!("repaired {} missing block number rows", repaired);
        }
        Ok(())
    }

    async fn reload_from_db(&self, restore_consumed: bool) -> Result<(), PipelineError> {
        self.store.clear_block_sets().await?;

        let rows = self.db.load_recent_blocks(RECENT_RELOAD_ROWS).await?;
        let mut all = Vec::with_capacity(rows.len());
        let mut pending = Vec::new();
        let mut consumed = Vec::new();
        for row in &rows {
            all.push(row.block_number);
            if row.consume_status == 0 {
                pending.push(row.block_number);
            } else if restore_consumed {
                consumed.push(row.block_number);
            }
        }

        self.store.add_to_set(BlockSet::All, &all).await?;
        self.store.add_to_set(BlockSet::NoConsumed, &pending).await?;
        if restore_consumed {
            self.store.add_to_set(BlockSet::Consumed, &consumed).await?;
        }

        tracing::info!(
            "reloaded {} block numbers from the database ({} pending)",
            all.len(),
            pending.len()
        );
        Ok(())
    }
}

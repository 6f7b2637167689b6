use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::PipelineError;
use crate::rpc::ChainClient;
use crate::store::{BlockSet, TaskStore};
use crate::types::{unix_now, TxRecord};

/// How long an idle worker waits for a wake-up before polling the queue
/// anyway.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FAILURE_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on concurrent per-transaction writes within one block.
const TX_FANOUT_LIMIT: usize = 16;

enum Extraction {
    Done,
    BodyMissing,
}

/// One worker of the consumer pool. Claims block numbers, extracts their
/// transactions into the shared buffer and advances the lifecycle state.
pub struct Consumer<S, C> {
    store: Arc<S>,
    chain: Arc<C>,
    wakeup: Arc<Notify>,
    cancel: CancellationToken,
    worker_id: usize,
}

impl<S: TaskStore, C: ChainClient> Consumer<S, C> {
    pub fn new(
        store: Arc<S>,
        chain: Arc<C>,
        wakeup: Arc<Notify>,
        cancel: CancellationToken,
        worker_id: usize,
    ) -> Self {
        Self {
            store,
            chain,
            wakeup,
            cancel,
            worker_id,
        }
    }

    pub async fn run(&self) -> Result<(), PipelineError> {
        self.drain_orphans().await?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.store.claim().await {
                Ok(Some(number)) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            // Give the claim back so another worker can
                            // finish it after restart.
                            self.store.release(number).await?;
                            return Ok(());
                        }
                        result = self.process_claimed(number) => result?,
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("worker {} claim failed: {}", self.worker_id, e);
                    tokio::time::sleep(FAILURE_BACKOFF).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Finish work left in the in-flight set by a prior crash before
    /// entering the normal claim loop.
    pub(crate) async fn drain_orphans(&self) -> Result<(), PipelineError> {
        while let Some(number) = self.store.claim_orphaned().await? {
            if self.cancel.is_cancelled() {
                self.store.release(number).await?;
                return Ok(());
            }
            tracing::info!("worker {} recovering orphaned block {}", self.worker_id, number);
            match self.extract_transactions(number).await {
                // The orphan was popped off the in-flight set, so there is
                // no claim left to re-check; duplicates are absorbed by the
                // database upsert.
                Ok(Extraction::Done) => {
                    self.store.add_to_set(BlockSet::Consumed, &[number]).await?;
                }
                Ok(Extraction::BodyMissing) => {
                    self.store.release(number).await?;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!("recovery of block {} failed: {}", number, e);
                    self.store.release(number).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) async fn process_claimed(&self, number: u64) -> Result<(), PipelineError> {
        match self.extract_transactions(number).await {
            Ok(Extraction::Done) => {
                // A monitor redistribution may have requeued the claim
                // while we worked; if so, drop it and let the next claimer
                // redo the block.
                if self.store.is_inflight(number).await? {
                    self.store.mark_consumed(number).await?;
                } else {
                    tracing::debug!("claim on block {} went stale, dropping", number);
                }
                Ok(())
            }
            Ok(Extraction::BodyMissing) => {
                tracing::warn!("block {} has no body yet, requeueing", number);
                self.store.release(number).await?;
                tokio::time::sleep(FAILURE_BACKOFF).await;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("processing of block {} failed: {}", number, e);
                self.store.release(number).await?;
                tokio::time::sleep(FAILURE_BACKOFF).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the block body and write every transaction record into the
    /// buffer. All writes join before this returns.
    async fn extract_transactions(&self, number: u64) -> Result<Extraction, PipelineError> {
        let Some(block) = self.chain.block_by_number(number).await? else {
            return Ok(Extraction::BodyMissing);
        };

        let now = unix_now();
        let semaphore = Arc::new(Semaphore::new(TX_FANOUT_LIMIT));
        let mut writes: JoinSet<Result<(), crate::store::StoreError>> = JoinSet::new();

        for tx in &block.transactions {
            let record = TxRecord::derive(tx, &block, now);
            let store = Arc::clone(&self.store);
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))?;
            writes.spawn(async move {
                let _permit = permit;
                store.put_tx(&record).await
            });
        }

        while let Some(result) = writes.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(PipelineError::Task(e.to_string())),
            }
        }

        tracing::info!(
            "worker {} extracted {} transactions from block {}",
            self.worker_id,
            block.transactions.len(),
            number
        );
        Ok(Extraction::Done)
    }
}

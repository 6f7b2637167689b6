use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::PipelineError;
use crate::rpc::{ChainClient, RpcError};
use crate::store::TaskStore;
use crate::types::HeadEvent;

/// Single-instance chain subscriber. Feeds the task queue with every block
/// number seen on the new-heads stream and broadcasts wake-ups.
pub struct Producer<S, C> {
    store: Arc<S>,
    chain: Arc<C>,
    wakeup: Arc<Notify>,
    cancel: CancellationToken,
}

impl<S: TaskStore, C: ChainClient> Producer<S, C> {
    pub fn new(
        store: Arc<S>,
        chain: Arc<C>,
        wakeup: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            chain,
            wakeup,
            cancel,
        }
    }

    /// Runs until the subscription dies (returned as an error so the
    /// coordinator can restart with a fresh client) or cancellation.
    pub async fn run(&self) -> Result<(), PipelineError> {
        let mut heads = self.chain.subscribe_heads().await?;
        tracing::info!("producer subscribed to new heads");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("producer stopping");
                    return Ok(());
                }
                head = heads.next() => match head {
                    Some(head) => self.handle_head(head).await?,
                    None => return Err(PipelineError::Rpc(RpcError::SubscriptionClosed)),
                },
            }
        }
    }

    pub(crate) async fn handle_head(&self, head: HeadEvent) -> Result<(), PipelineError> {
        // One retry on a missing body, then leave the gap for the monitor.
        let block = match self.chain.block_by_hash(head.hash).await {
            Ok(Some(block)) => Some(block),
            Ok(None) => self.chain.block_by_hash(head.hash).await.ok().flatten(),
            Err(e) => {
                tracing::warn!("fetch of new head {} failed: {}, retrying once", head.number, e);
                self.chain.block_by_hash(head.hash).await.ok().flatten()
            }
        };

        let Some(block) = block else {
            tracing::warn!(
                "block {} unavailable after retry, monitor will fill the gap",
                head.number
            );
            return Ok(());
        };

        self.store.add_new(block.number).await?;

        // Advisory broadcast; a lost wake-up only delays the claim poll.
        if let Err(e) = self.store.publish_new_block(block.number).await {
            tracing::warn!("wake-up publish for block {} failed: {}", block.number, e);
        }
        self.wakeup.notify_waiters();

        tracing::info!(
            "registered block {} ({} txs)",
            block.number,
            block.transactions.len()
        );
        Ok(())
    }
}

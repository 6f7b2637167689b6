use std::future::Future;
use std::time::Duration;

use alloy::consensus::{Transaction as _, Typed2718};
use alloy::network::Ethereum;
use alloy::primitives::B256;
use alloy::providers::{Provider, RootProvider, WsConnect};
use alloy::rpc::client::ClientBuilder;
use alloy::rpc::types::{Block, BlockId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use url::Url;

use crate::types::{BlockData, HeadEvent, TxData};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport: {0}")]
    Transport(String),

    #[error("invalid rpc url: {0}")]
    InvalidUrl(String),

    #[error("provider: {0}")]
    Provider(String),

    #[error("new-heads subscription closed")]
    SubscriptionClosed,
}

impl RpcError {
    /// Whether another attempt against the same endpoint can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Provider(msg) => transient_message(msg),
            RpcError::InvalidUrl(_) => false,
            // A dead subscription needs a fresh client, not a retry
            RpcError::SubscriptionClosed => false,
        }
    }
}

fn transient_message(msg: &str) -> bool {
    const TRANSIENT_MARKERS: &[&str] = &[
        "connection",
        "timeout",
        "timed out",
        "reset",
        "broken pipe",
        "eof",
        "too many requests",
        "429",
        "502",
        "503",
        "504",
        "unavailable",
        "try again",
    ];
    let msg = msg.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| msg.contains(marker))
}

/// Bounded exponential backoff for chain calls. These retries only cover
/// short outages; a block that stays unreachable is skipped and repaired
/// by the monitor, so the policy is deliberately small.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 8,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the n-th consecutive failure: base doubled per failure,
    /// capped at `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Run a chain call, retrying transient failures until the policy is
/// exhausted. Permanent errors surface immediately.
pub async fn retry_rpc<F, Fut, T>(
    policy: &RetryPolicy,
    op: &str,
    mut call: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut failures = 0u32;
    loop {
        match call().await {
            Ok(value) => {
                if failures > 0 {
                    tracing::info!("{} recovered after {} failed attempts", op, failures);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && failures + 1 < policy.attempts => {
                failures += 1;
                let delay = policy.backoff(failures);
                tracing::warn!(
                    "{} failed ({}), attempt {}/{}, backing off {:?}",
                    op,
                    e,
                    failures,
                    policy.attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: Url,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl RpcClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// The chain operations the pipeline depends on. Producer restarts swap
/// the implementation behind a fresh connection, so everything is behind
/// this seam.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Stream of new block headers in chain order. The stream ending means
    /// the underlying subscription died.
    async fn subscribe_heads(&self) -> Result<BoxStream<'static, HeadEvent>, RpcError>;

    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockData>, RpcError>;

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockData>, RpcError>;

    async fn latest_block_number(&self) -> Result<u64, RpcError>;
}

/// Production client over an alloy WebSocket provider.
pub struct RpcChainClient {
    provider: RootProvider<Ethereum>,
    config: RpcClientConfig,
}

impl RpcChainClient {
    pub async fn connect(config: RpcClientConfig) -> Result<Self, RpcError> {
        let ws = WsConnect::new(config.url.as_str());
        let client = ClientBuilder::default()
            .ws(ws)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let provider = RootProvider::<Ethereum>::new(client);

        Ok(Self { provider, config })
    }

    async fn bounded<T, Fut>(&self, op: &str, fut: Fut) -> Result<T, RpcError>
    where
        Fut: Future<Output = Result<T, RpcError>>,
    {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| RpcError::Transport(format!("'{}' timed out", op)))?
    }

    async fn fetch_block(&self, block_id: BlockId) -> Result<Option<BlockData>, RpcError> {
        let op = format!("eth_getBlock({:?})", block_id);
        let block = retry_rpc(&self.config.retry, &op, || async {
            self.bounded(&op, async {
                self.provider
                    .get_block(block_id)
                    .full()
                    .await
                    .map_err(|e| RpcError::Provider(e.to_string()))
            })
            .await
        })
        .await?;
        Ok(block.map(convert_block))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn subscribe_heads(&self) -> Result<BoxStream<'static, HeadEvent>, RpcError> {
        let subscription = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let stream = subscription
            .into_stream()
            .map(|header| HeadEvent {
                number: header.number,
                hash: header.hash,
            })
            .boxed();
        Ok(stream)
    }

    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockData>, RpcError> {
        self.fetch_block(BlockId::hash(hash)).await
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockData>, RpcError> {
        self.fetch_block(BlockId::number(number)).await
    }

    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        retry_rpc(&self.config.retry, "eth_blockNumber", || async {
            self.bounded("eth_blockNumber", async {
                self.provider
                    .get_block_number()
                    .await
                    .map_err(|e| RpcError::Provider(e.to_string()))
            })
            .await
        })
        .await
    }
}

impl std::fmt::Debug for RpcChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChainClient")
            .field("config", &self.config)
            .finish()
    }
}

fn convert_block(block: Block) -> BlockData {
    let transactions: Vec<TxData> = block
        .transactions
        .txns()
        .map(convert_transaction)
        .collect();
    BlockData {
        number: block.header.number,
        hash: format!("{:#x}", block.header.hash),
        timestamp: block.header.timestamp,
        transactions,
    }
}

fn convert_transaction(tx: &alloy::rpc::types::Transaction) -> TxData {
    let gas_price = tx
        .gas_price()
        .or(tx.effective_gas_price)
        .unwrap_or_else(|| tx.max_fee_per_gas());
    TxData {
        hash: format!("{:#x}", tx.inner.tx_hash()),
        from: format!("{:#x}", tx.inner.signer()),
        to: tx.to().map(|address| format!("{:#x}", address)),
        value: tx.value().to_string(),
        nonce: tx.nonce(),
        gas_price,
        gas_limit: tx.gas_limit(),
        input: tx.input().to_vec(),
        tx_type: tx.ty(),
        chain_id: tx.chain_id(),
    }
}

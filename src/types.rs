use serde::{Deserialize, Serialize};

/// A new block header seen on the subscription stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadEvent {
    pub number: u64,
    pub hash: alloy::primitives::B256,
}

/// A fetched block body, reduced to the fields the pipeline consumes.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub transactions: Vec<TxData>,
}

/// A single transaction as returned by the chain, before normalization.
#[derive(Debug, Clone)]
pub struct TxData {
    pub hash: String,
    pub from: String,
    /// None for contract creation.
    pub to: Option<String>,
    pub value: String,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub input: Vec<u8>,
    pub tx_type: u8,
    pub chain_id: Option<u64>,
}

/// The normalized record persisted to the `transactions` table, keyed on
/// `(hash, block_number)`. Serialized as JSON while buffered in redis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub from: String,
    pub to: String,
    pub value: String,
    pub nonce: u64,
    pub gas_price: String,
    pub transaction_fee: String,
    pub byte4_selector: String,
    pub timestamp: u64,
    pub tx_type: u8,
    pub chain_id: u64,
    pub confirmations: u64,
    pub block_txs: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TxRecord {
    /// Normalize a chain transaction into its durable form.
    ///
    /// The byte4 selector is the first four bytes of call data, or the full
    /// data when shorter. Contract creations get an empty `to`.
    pub fn derive(tx: &TxData, block: &BlockData, now: u64) -> Self {
        let selector = if tx.input.len() > 4 {
            &tx.input[..4]
        } else {
            &tx.input[..]
        };

        let fee = tx.gas_price.saturating_mul(tx.gas_limit as u128);

        TxRecord {
            hash: tx.hash.clone(),
            block_number: block.number,
            block_hash: block.hash.clone(),
            from: tx.from.clone(),
            to: tx.to.clone().unwrap_or_default(),
            value: tx.value.clone(),
            nonce: tx.nonce,
            gas_price: tx.gas_price.to_string(),
            transaction_fee: fee.to_string(),
            byte4_selector: hex::encode(selector),
            timestamp: block.timestamp,
            tx_type: tx.tx_type,
            chain_id: tx.chain_id.unwrap_or(1),
            confirmations: 0,
            block_txs: block.transactions.len() as u64,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

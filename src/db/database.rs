use async_trait::async_trait;

use super::error::DbError;
use super::pool::DbPool;
use crate::types::{unix_now, TxRecord};

/// Rows per database transaction for bulk writes.
pub const ROWS_PER_TXN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockNumberRow {
    pub block_number: u64,
    pub consume_status: i16,
}

/// The relational-store surface the Flusher writes through. Only the
/// Flusher touches the database; everything else goes through redis.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn max_block_number(&self) -> Result<Option<u64>, DbError>;

    /// Newest rows first, up to `limit`.
    async fn load_recent_blocks(&self, limit: i64) -> Result<Vec<BlockNumberRow>, DbError>;

    /// Upsert every number in `[from, to]`. A `consumed` upsert writes
    /// status 1; a pending upsert never downgrades an existing status.
    async fn upsert_block_range(&self, from: u64, to: u64, consumed: bool) -> Result<(), DbError>;

    async fn mark_blocks_consumed(&self, numbers: &[u64]) -> Result<(), DbError>;

    /// Fill holes in `block_numbers` between its min and max with
    /// `consume_status = 0` rows. Returns how many rows were inserted.
    async fn repair_block_gaps(&self) -> Result<u64, DbError>;

    async fn upsert_transactions(&self, records: &[TxRecord]) -> Result<(), DbError>;
}

const UPSERT_BLOCK_SQL: &str = "INSERT INTO block_numbers \
     (block_number, consume_status, created_at, updated_at) \
     VALUES ($1, $2, $3, $3) \
     ON CONFLICT (block_number) DO UPDATE SET \
     consume_status = GREATEST(block_numbers.consume_status, EXCLUDED.consume_status), \
     updated_at = EXCLUDED.updated_at";

const GAP_REPAIR_SQL: &str = "WITH RECURSIVE seq AS ( \
         SELECT MIN(block_number) AS n FROM block_numbers \
         UNION ALL \
         SELECT n + 1 FROM seq WHERE n + 1 <= (SELECT MAX(block_number) FROM block_numbers) \
     ) \
     INSERT INTO block_numbers (block_number, consume_status, created_at, updated_at) \
     SELECT seq.n, 0, $1, $1 FROM seq \
     LEFT JOIN block_numbers ON seq.n = block_numbers.block_number \
     WHERE block_numbers.block_number IS NULL";

const UPSERT_TX_SQL: &str = "INSERT INTO transactions \
     (hash, block_number, block_hash, from_addr, to_addr, value, nonce, \
      gas_price, transaction_fee, byte4_selector, timestamp, tx_type, \
      chain_id, confirmations, block_txs, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
     ON CONFLICT (hash, block_number) DO UPDATE SET updated_at = EXCLUDED.updated_at";

pub struct PgDatabase {
    pool: DbPool,
}

impl PgDatabase {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn max_block_number(&self) -> Result<Option<u64>, DbError> {
        let client = self.pool.inner().get().await?;
        let row = client
            .query_one("SELECT MAX(block_number) FROM block_numbers", &[])
            .await?;
        let max: Option<i64> = row.get(0);
        Ok(max.map(|n| n as u64))
    }

    async fn load_recent_blocks(&self, limit: i64) -> Result<Vec<BlockNumberRow>, DbError> {
        let client = self.pool.inner().get().await?;
        let rows = client
            .query(
                "SELECT block_number, consume_status FROM block_numbers \
                 ORDER BY block_number DESC LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| BlockNumberRow {
                block_number: row.get::<_, i64>(0) as u64,
                consume_status: row.get(1),
            })
            .collect())
    }

    async fn upsert_block_range(&self, from: u64, to: u64, consumed: bool) -> Result<(), DbError> {
        if from > to {
            return Ok(());
        }
        let status: i16 = if consumed { 1 } else { 0 };
        let now = unix_now() as i64;

        let mut current = from;
        while current <= to {
            let batch_end = std::cmp::min(current + ROWS_PER_TXN as u64 - 1, to);

            let mut client = self.pool.inner().get().await?;
            let tx = client.transaction().await?;
            let stmt = tx.prepare(UPSERT_BLOCK_SQL).await?;
            for number in current..=batch_end {
                tx.execute(&stmt, &[&(number as i64), &status, &now]).await?;
            }
            tx.commit().await?;

            current = batch_end + 1;
        }
        Ok(())
    }

    async fn mark_blocks_consumed(&self, numbers: &[u64]) -> Result<(), DbError> {
        let now = unix_now() as i64;
        for chunk in numbers.chunks(ROWS_PER_TXN) {
            let mut client = self.pool.inner().get().await?;
            let tx = client.transaction().await?;
            let stmt = tx
                .prepare(
                    "UPDATE block_numbers SET consume_status = 1, updated_at = $2 \
                     WHERE block_number = $1",
                )
                .await?;
            for number in chunk {
                tx.execute(&stmt, &[&(*number as i64), &now]).await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn repair_block_gaps(&self) -> Result<u64, DbError> {
        let client = self.pool.inner().get().await?;
        let now = unix_now() as i64;
        let inserted = client.execute(GAP_REPAIR_SQL, &[&now]).await?;
        Ok(inserted)
    }

    async fn upsert_transactions(&self, records: &[TxRecord]) -> Result<(), DbError> {
        for chunk in records.chunks(ROWS_PER_TXN) {
            let mut client = self.pool.inner().get().await?;
            let tx = client.transaction().await?;
            let stmt = tx.prepare(UPSERT_TX_SQL).await?;
            for record in chunk {
                tx.execute(
                    &stmt,
                    &[
                        &record.hash,
                        &(record.block_number as i64),
                        &record.block_hash,
                        &record.from,
                        &record.to,
                        &record.value,
                        &(record.nonce as i64),
                        &record.gas_price,
                        &record.transaction_fee,
                        &record.byte4_selector,
                        &(record.timestamp as i64),
                        &(record.tx_type as i16),
                        &(record.chain_id as i64),
                        &(record.confirmations as i64),
                        &(record.block_txs as i64),
                        &(record.created_at as i64),
                        &(record.updated_at as i64),
                    ],
                )
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};

use super::error::StoreError;
use crate::types::TxRecord;

pub const ALL_BLOCK_NUMBER: &str = "all_block_number";
pub const NO_CONSUMED_BLOCK_NUMBER: &str = "no_consumed_block_number";
pub const CONSUMING_BLOCK_NUMBER: &str = "consuming_block_number";
pub const CONSUMED_BLOCK_NUMBER: &str = "consumed_block_number";
pub const TRANSACTIONS: &str = "transactions";
pub const NEW_BLOCK_CHANNEL: &str = "new_block_channel";

/// Lifecycle stage of a block number in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockSet {
    All,
    NoConsumed,
    Consuming,
    Consumed,
}

impl BlockSet {
    pub fn key(self) -> &'static str {
        match self {
            BlockSet::All => ALL_BLOCK_NUMBER,
            BlockSet::NoConsumed => NO_CONSUMED_BLOCK_NUMBER,
            BlockSet::Consuming => CONSUMING_BLOCK_NUMBER,
            BlockSet::Consumed => CONSUMED_BLOCK_NUMBER,
        }
    }
}

/// The task-queue surface shared by Producer, Consumers, Monitor and
/// Flusher. The store is the only synchronization medium between them, so
/// every operation here is atomic at the level of a single call.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Register a newly observed block number as pending work.
    async fn add_new(&self, number: u64) -> Result<(), StoreError>;

    /// Atomically move one pending number into the in-flight set.
    async fn claim(&self) -> Result<Option<u64>, StoreError>;

    /// Pop a number orphaned in the in-flight set by a prior crash.
    async fn claim_orphaned(&self) -> Result<Option<u64>, StoreError>;

    /// Move `number` from in-flight to consumed. No-op when the claim has
    /// already been requeued; returns whether the move happened.
    async fn mark_consumed(&self, number: u64) -> Result<bool, StoreError>;

    /// Whether `number` is still held by the in-flight set.
    async fn is_inflight(&self, number: u64) -> Result<bool, StoreError>;

    /// Return a failed claim to the pending set.
    async fn release(&self, number: u64) -> Result<(), StoreError>;

    /// Move everything in-flight back to pending.
    async fn requeue_stale(&self) -> Result<(), StoreError>;

    /// Rebuild ALL as the union of the three lifecycle sets; returns |ALL|.
    async fn union_all(&self) -> Result<u64, StoreError>;

    /// Recompute pending = ALL minus consumed minus in-flight.
    async fn diff_repair(&self) -> Result<(), StoreError>;

    async fn block_numbers(&self, set: BlockSet) -> Result<Vec<u64>, StoreError>;

    async fn contains(&self, set: BlockSet, number: u64) -> Result<bool, StoreError>;

    /// Pipelined bulk insert into one set.
    async fn add_to_set(&self, set: BlockSet, numbers: &[u64]) -> Result<(), StoreError>;

    /// Prune a flushed range from ALL and CONSUMED.
    async fn remove_flushed(&self, from: u64, to: u64) -> Result<(), StoreError>;

    /// Drop ALL, NO_CONSUMED and CONSUMED ahead of a reload from the
    /// database.
    async fn clear_block_sets(&self) -> Result<(), StoreError>;

    async fn put_tx(&self, record: &TxRecord) -> Result<(), StoreError>;

    /// Cursor-paged scan of the transaction buffer. A zero next-cursor
    /// means the scan wrapped around.
    async fn scan_txs(&self, cursor: u64, count: usize)
        -> Result<(Vec<TxRecord>, u64), StoreError>;

    async fn delete_txs(&self, hashes: &[String]) -> Result<(), StoreError>;

    async fn tx_backlog(&self) -> Result<u64, StoreError>;

    /// Advisory wake-up broadcast; consumers must not depend on delivery.
    async fn publish_new_block(&self, number: u64) -> Result<(), StoreError>;
}

/// Production implementation over a redis multiplexed connection.
pub struct RedisTaskStore {
    conn: ConnectionManager,
    claim_script: Script,
    mark_script: Script,
}

impl RedisTaskStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(10))
            .set_response_timeout(Duration::from_secs(10));
        let conn = client.get_connection_manager_with_config(config).await?;
        tracing::info!("connected to redis task store");
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: ConnectionManager) -> Self {
        // SPOP and SADD must land together so a crash between them cannot
        // strand a number in neither set.
        let claim_script = Script::new(
            r"local n = redis.call('SPOP', KEYS[1])
              if n then redis.call('SADD', KEYS[2], n) end
              return n",
        );
        let mark_script = Script::new(
            r"if redis.call('SREM', KEYS[1], ARGV[1]) == 1 then
                  redis.call('SADD', KEYS[2], ARGV[1])
                  return 1
              end
              return 0",
        );
        Self {
            conn,
            claim_script,
            mark_script,
        }
    }

    fn parse_number(raw: &str) -> Result<u64, StoreError> {
        raw.parse::<u64>()
            .map_err(|_| StoreError::MalformedNumber(raw.to_string()))
    }
}

/// HSCAN yields a flat field/value sequence; decode the value half.
fn parse_scan_pairs(items: &[String]) -> Result<Vec<TxRecord>, StoreError> {
    items
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| serde_json::from_str::<TxRecord>(&pair[1]).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn add_new(&self, number: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(ALL_BLOCK_NUMBER, number)
            .ignore()
            .sadd(NO_CONSUMED_BLOCK_NUMBER, number)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn claim(&self) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = self
            .claim_script
            .key(NO_CONSUMED_BLOCK_NUMBER)
            .key(CONSUMING_BLOCK_NUMBER)
            .invoke_async(&mut conn)
            .await?;
        popped.map(|raw| Self::parse_number(&raw)).transpose()
    }

    async fn claim_orphaned(&self) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = conn.spop(CONSUMING_BLOCK_NUMBER).await?;
        popped.map(|raw| Self::parse_number(&raw)).transpose()
    }

    async fn mark_consumed(&self, number: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .mark_script
            .key(CONSUMING_BLOCK_NUMBER)
            .key(CONSUMED_BLOCK_NUMBER)
            .arg(number)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn is_inflight(&self, number: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let member: bool = conn.sismember(CONSUMING_BLOCK_NUMBER, number).await?;
        Ok(member)
    }

    async fn release(&self, number: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(CONSUMING_BLOCK_NUMBER, number)
            .ignore()
            .sadd(NO_CONSUMED_BLOCK_NUMBER, number)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn requeue_stale(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SUNIONSTORE")
            .arg(NO_CONSUMED_BLOCK_NUMBER)
            .arg(NO_CONSUMED_BLOCK_NUMBER)
            .arg(CONSUMING_BLOCK_NUMBER)
            .ignore()
            .del(CONSUMING_BLOCK_NUMBER)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn union_all(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("SUNIONSTORE")
            .arg(ALL_BLOCK_NUMBER)
            .arg(NO_CONSUMED_BLOCK_NUMBER)
            .arg(CONSUMING_BLOCK_NUMBER)
            .arg(CONSUMED_BLOCK_NUMBER)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn diff_repair(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("SDIFFSTORE")
            .arg(NO_CONSUMED_BLOCK_NUMBER)
            .arg(ALL_BLOCK_NUMBER)
            .arg(CONSUMED_BLOCK_NUMBER)
            .arg(CONSUMING_BLOCK_NUMBER)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn block_numbers(&self, set: BlockSet) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(set.key()).await?;
        members
            .iter()
            .map(|raw| Self::parse_number(raw))
            .collect()
    }

    async fn contains(&self, set: BlockSet, number: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let member: bool = conn.sismember(set.key(), number).await?;
        Ok(member)
    }

    async fn add_to_set(&self, set: BlockSet, numbers: &[u64]) -> Result<(), StoreError> {
        if numbers.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for number in numbers {
            pipe.sadd(set.key(), *number).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_flushed(&self, from: u64, to: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for number in from..=to {
            pipe.srem(ALL_BLOCK_NUMBER, number).ignore();
            pipe.srem(CONSUMED_BLOCK_NUMBER, number).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn clear_block_sets(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(&[
                ALL_BLOCK_NUMBER,
                NO_CONSUMED_BLOCK_NUMBER,
                CONSUMED_BLOCK_NUMBER,
            ])
            .await?;
        Ok(())
    }

    async fn put_tx(&self, record: &TxRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        let _: () = conn.hset(TRANSACTIONS, &record.hash, payload).await?;
        Ok(())
    }

    async fn scan_txs(
        &self,
        cursor: u64,
        count: usize,
    ) -> Result<(Vec<TxRecord>, u64), StoreError> {
        let mut conn = self.conn.clone();
        let (next_cursor, items): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(TRANSACTIONS)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((parse_scan_pairs(&items)?, next_cursor))
    }

    async fn delete_txs(&self, hashes: &[String]) -> Result<(), StoreError> {
        if hashes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for hash in hashes {
            pipe.hdel(TRANSACTIONS, hash).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn tx_backlog(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.hlen(TRANSACTIONS).await?;
        Ok(len)
    }

    async fn publish_new_block(&self, number: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(NEW_BLOCK_CHANNEL, number).await?;
        Ok(())
    }
}

//! In-memory doubles for the three external seams, used by the pipeline
//! test suite. They mirror the semantics of the production backends
//! (redis set ops, postgres upserts, chain RPC) without any I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::db::{BlockNumberRow, Database, DbError};
use crate::rpc::{ChainClient, RpcError};
use crate::store::{BlockSet, StoreError, TaskStore};
use crate::types::{BlockData, HeadEvent, TxData, TxRecord};

#[derive(Default)]
struct StoreState {
    all: BTreeSet<u64>,
    no_consumed: BTreeSet<u64>,
    consuming: BTreeSet<u64>,
    consumed: BTreeSet<u64>,
    txs: BTreeMap<String, TxRecord>,
    published: Vec<u64>,
}

#[derive(Default)]
pub(crate) struct MemoryTaskStore {
    state: Mutex<StoreState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<u64> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn set_len(&self, set: BlockSet) -> usize {
        let state = self.state.lock().unwrap();
        match set {
            BlockSet::All => state.all.len(),
            BlockSet::NoConsumed => state.no_consumed.len(),
            BlockSet::Consuming => state.consuming.len(),
            BlockSet::Consumed => state.consumed.len(),
        }
    }

    /// Put a number straight into a lifecycle set, bypassing the normal
    /// transitions, to stage crash scenarios.
    pub fn force_into(&self, set: BlockSet, number: u64) {
        let mut state = self.state.lock().unwrap();
        match set {
            BlockSet::All => state.all.insert(number),
            BlockSet::NoConsumed => state.no_consumed.insert(number),
            BlockSet::Consuming => state.consuming.insert(number),
            BlockSet::Consumed => state.consumed.insert(number),
        };
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn add_new(&self, number: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.all.insert(number);
        state.no_consumed.insert(number);
        Ok(())
    }

    async fn claim(&self) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let popped = state.no_consumed.iter().next().copied();
        if let Some(number) = popped {
            state.no_consumed.remove(&number);
            state.consuming.insert(number);
        }
        Ok(popped)
    }

    async fn claim_orphaned(&self) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let popped = state.consuming.iter().next().copied();
        if let Some(number) = popped {
            state.consuming.remove(&number);
        }
        Ok(popped)
    }

    async fn mark_consumed(&self, number: u64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.consuming.remove(&number) {
            state.consumed.insert(number);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn is_inflight(&self, number: u64) -> Result<bool, StoreError> {
        Ok(self.state.lock().unwrap().consuming.contains(&number))
    }

    async fn release(&self, number: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.consuming.remove(&number);
        state.no_consumed.insert(number);
        Ok(())
    }

    async fn requeue_stale(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let stale: Vec<u64> = state.consuming.iter().copied().collect();
        state.consuming.clear();
        state.no_consumed.extend(stale);
        Ok(())
    }

    async fn union_all(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut union = BTreeSet::new();
        union.extend(state.no_consumed.iter().copied());
        union.extend(state.consuming.iter().copied());
        union.extend(state.consumed.iter().copied());
        state.all = union;
        Ok(state.all.len() as u64)
    }

    async fn diff_repair(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let pending: BTreeSet<u64> = state
            .all
            .iter()
            .copied()
            .filter(|n| !state.consumed.contains(n) && !state.consuming.contains(n))
            .collect();
        state.no_consumed = pending;
        Ok(())
    }

    async fn block_numbers(&self, set: BlockSet) -> Result<Vec<u64>, StoreError> {
        let state = self.state.lock().unwrap();
        let members = match set {
            BlockSet::All => &state.all,
            BlockSet::NoConsumed => &state.no_consumed,
            BlockSet::Consuming => &state.consuming,
            BlockSet::Consumed => &state.consumed,
        };
        Ok(members.iter().copied().collect())
    }

    async fn contains(&self, set: BlockSet, number: u64) -> Result<bool, StoreError> {
        let state = self.state.lock().unwrap();
        let members = match set {
            BlockSet::All => &state.all,
            BlockSet::NoConsumed => &state.no_consumed,
            BlockSet::Consuming => &state.consuming,
            BlockSet::Consumed => &state.consumed,
        };
        Ok(members.contains(&number))
    }

    async fn add_to_set(&self, set: BlockSet, numbers: &[u64]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let members = match set {
            BlockSet::All => &mut state.all,
            BlockSet::NoConsumed => &mut state.no_consumed,
            BlockSet::Consuming => &mut state.consuming,
            BlockSet::Consumed => &mut state.consumed,
        };
        members.extend(numbers.iter().copied());
        Ok(())
    }

    async fn remove_flushed(&self, from: u64, to: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for number in from..=to {
            state.all.remove(&number);
            state.consumed.remove(&number);
        }
        Ok(())
    }

    async fn clear_block_sets(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.all.clear();
        state.no_consumed.clear();
        state.consumed.clear();
        Ok(())
    }

    async fn put_tx(&self, record: &TxRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.txs.insert(record.hash.clone(), record.clone());
        Ok(())
    }

    async fn scan_txs(
        &self,
        cursor: u64,
        count: usize,
    ) -> Result<(Vec<TxRecord>, u64), StoreError> {
        let state = self.state.lock().unwrap();
        let records: Vec<TxRecord> = state
            .txs
            .values()
            .skip(cursor as usize)
            .take(count)
            .cloned()
            .collect();
        let end = cursor as usize + records.len();
        let next_cursor = if end >= state.txs.len() { 0 } else { end as u64 };
        Ok((records, next_cursor))
    }

    async fn delete_txs(&self, hashes: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for hash in hashes {
            state.txs.remove(hash);
        }
        Ok(())
    }

    async fn tx_backlog(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().unwrap().txs.len() as u64)
    }

    async fn publish_new_block(&self, number: u64) -> Result<(), StoreError> {
        self.state.lock().unwrap().published.push(number);
        Ok(())
    }
}

#[derive(Default)]
struct DbState {
    blocks: BTreeMap<u64, i16>,
    txs: BTreeMap<(String, u64), TxRecord>,
}

#[derive(Default)]
pub(crate) struct MemoryDatabase {
    state: Mutex<DbState>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(numbers: impl IntoIterator<Item = (u64, i16)>) -> Self {
        let db = Self::default();
        db.state.lock().unwrap().blocks.extend(numbers);
        db
    }

    pub fn block_status(&self, number: u64) -> Option<i16> {
        self.state.lock().unwrap().blocks.get(&number).copied()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().unwrap().blocks.len()
    }

    pub fn tx_count(&self) -> usize {
        self.state.lock().unwrap().txs.len()
    }

    pub fn has_tx(&self, hash: &str, block_number: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .txs
            .contains_key(&(hash.to_string(), block_number))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn max_block_number(&self) -> Result<Option<u64>, DbError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .keys()
            .next_back()
            .copied())
    }

    async fn load_recent_blocks(&self, limit: i64) -> Result<Vec<BlockNumberRow>, DbError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .iter()
            .rev()
            .take(limit as usize)
            .map(|(&block_number, &consume_status)| BlockNumberRow {
                block_number,
                consume_status,
            })
            .collect())
    }

    async fn upsert_block_range(&self, from: u64, to: u64, consumed: bool) -> Result<(), DbError> {
        let status: i16 = if consumed { 1 } else { 0 };
        let mut state = self.state.lock().unwrap();
        for number in from..=to {
            let entry = state.blocks.entry(number).or_insert(0);
            *entry = (*entry).max(status);
        }
        Ok(())
    }

    async fn mark_blocks_consumed(&self, numbers: &[u64]) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        for number in numbers {
            state.blocks.insert(*number, 1);
        }
        Ok(())
    }

    async fn repair_block_gaps(&self) -> Result<u64, DbError> {
        let mut state = self.state.lock().unwrap();
        let (Some(&min), Some(&max)) = (
            state.blocks.keys().next(),
            state.blocks.keys().next_back(),
        ) else {
            return Ok(0);
        };
        let mut inserted = 0;
        for number in min..=max {
            if !state.blocks.contains_key(&number) {
                state.blocks.insert(number, 0);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_transactions(&self, records: &[TxRecord]) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        for record in records {
            state
                .txs
                .insert((record.hash.clone(), record.block_number), record.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
struct ChainState {
    blocks_by_number: HashMap<u64, BlockData>,
    hash_index: HashMap<B256, u64>,
    tip: u64,
    heads: Vec<HeadEvent>,
    /// Bodies that never resolve.
    unavailable: HashSet<u64>,
    /// Bodies that fail once, then resolve.
    flaky: HashSet<u64>,
}

/// A scripted chain: a fixed set of blocks, a tip and a head stream.
#[derive(Default)]
pub(crate) struct StaticChain {
    state: Mutex<ChainState>,
}

pub(crate) fn block_hash(number: u64) -> B256 {
    B256::from(U256::from(number) + U256::from(0xb10c_0000u64))
}

pub(crate) fn test_tx(block_number: u64, index: u64) -> TxData {
    TxData {
        hash: format!("0xtx{}_{}", block_number, index),
        from: "0xfeed".to_string(),
        to: Some("0xcafe".to_string()),
        value: "100".to_string(),
        nonce: index,
        gas_price: 1_000_000_000,
        gas_limit: 21_000,
        input: vec![0xde, 0xad, 0xbe, 0xef, 0x01],
        tx_type: 2,
        chain_id: Some(1),
    }
}

pub(crate) fn test_block(number: u64, tx_count: u64) -> BlockData {
    BlockData {
        number,
        hash: format!("{:#x}", block_hash(number)),
        timestamp: 1_700_000_000 + number,
        transactions: (0..tx_count).map(|i| test_tx(number, i)).collect(),
    }
}

impl StaticChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, block: BlockData) {
        let mut state = self.state.lock().unwrap();
        state.hash_index.insert(block_hash(block.number), block.number);
        state.tip = state.tip.max(block.number);
        state.blocks_by_number.insert(block.number, block);
    }

    pub fn add_head(&self, number: u64) {
        self.state.lock().unwrap().heads.push(HeadEvent {
            number,
            hash: block_hash(number),
        });
    }

    pub fn set_tip(&self, tip: u64) {
        self.state.lock().unwrap().tip = tip;
    }

    pub fn mark_unavailable(&self, number: u64) {
        self.state.lock().unwrap().unavailable.insert(number);
    }

    pub fn mark_flaky(&self, number: u64) {
        self.state.lock().unwrap().flaky.insert(number);
    }
}

#[async_trait]
impl ChainClient for StaticChain {
    async fn subscribe_heads(&self) -> Result<BoxStream<'static, HeadEvent>, RpcError> {
        let heads = self.state.lock().unwrap().heads.clone();
        Ok(futures::stream::iter(heads)
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn block_by_hash(&self, hash: B256) -> Result<Option<BlockData>, RpcError> {
        let mut state = self.state.lock().unwrap();
        let Some(&number) = state.hash_index.get(&hash) else {
            return Ok(None);
        };
        if state.unavailable.contains(&number) {
            return Ok(None);
        }
        if state.flaky.remove(&number) {
            return Ok(None);
        }
        Ok(state.blocks_by_number.get(&number).cloned())
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockData>, RpcError> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable.contains(&number) {
            return Ok(None);
        }
        if state.flaky.remove(&number) {
            return Ok(None);
        }
        Ok(state.blocks_by_number.get(&number).cloned())
    }

    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().tip)
    }
}

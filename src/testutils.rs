//! In-memory stand-ins for the database and the node.

use crate::{
    attribution::CreatorDirectory,
    db::{BlockRow, ChainStore, DbError, Payment},
    payload::{CreatorId, Payload},
    source::{BlockRef, ChainSource, FetchError, NormalizedBlock, NormalizedTx, TxOutput},
};
use bitcoin::{hashes::Hash, BlockHash, Txid};

use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
};

use async_trait::async_trait;

pub const CREATOR: &str = "0102030405060708";
pub const CONTRACT: &str = "bitcoincash:pq3wdrdyfy4yyp8l4rs5jzgeyjj2vmn9yq3f9jhvrj";

/// Distinct hashes for distinct (branch, height).
pub fn block_hash(branch: u8, height: u64) -> BlockHash {
    let mut raw = [0u8; 32];
    raw[0] = branch;
    raw[24..].copy_from_slice(&height.to_be_bytes());
    BlockHash::from_inner(raw)
}

pub fn txid(tag: u8, n: u64) -> Txid {
    let mut raw = [0xffu8; 32];
    raw[0] = tag;
    raw[24..].copy_from_slice(&n.to_be_bytes());
    Txid::from_inner(raw)
}

pub fn creator_id() -> CreatorId {
    CreatorId::from_str(CREATOR).unwrap()
}

pub fn creators() -> CreatorDirectory {
    vec![(creator_id(), CONTRACT.to_string())]
        .into_iter()
        .collect()
}

pub fn pay_to(address: &str, value_sats: u64) -> TxOutput {
    TxOutput {
        value_sats,
        script: vec![0xa9, 0x14],
        address: Some(address.to_string()),
    }
}

pub fn op_return(script: Vec<u8>) -> TxOutput {
    TxOutput {
        value_sats: 0,
        script,
        address: None,
    }
}

/// A transaction tipping our creator.
pub fn tip_tx(txid: Txid, amount_sats: u64) -> NormalizedTx {
    let payload = Payload::new(CREATOR, 1).unwrap();
    NormalizedTx {
        txid,
        outputs: vec![
            op_return(payload.op_return_script().unwrap()),
            pay_to(CONTRACT, amount_sats),
        ],
        sender_address: Some("bitcoincash:qrsender".to_string()),
    }
}

#[derive(Debug, Default)]
pub struct MemStore {
    pub blocks: BTreeMap<u64, BlockRow>,
    pub payments: HashMap<Txid, Payment>,
    pub creators: CreatorDirectory,
}

impl MemStore {
    pub fn with_creators(creators: CreatorDirectory) -> Self {
        MemStore {
            creators,
            ..MemStore::default()
        }
    }

    /// Whether the blocks form a single chain, each one's parent being the block right
    /// below it.
    pub fn is_unbroken(&self) -> bool {
        self.blocks
            .values()
            .zip(self.blocks.values().skip(1))
            .all(|(below, above)| {
                above.height == below.height + 1 && above.parent_hash == below.hash
            })
    }
}

#[async_trait]
impl ChainStore for MemStore {
    async fn tip(&mut self) -> Result<Option<BlockRow>, DbError> {
        Ok(self.blocks.values().next_back().cloned())
    }

    async fn block_index(&mut self) -> Result<HashMap<BlockHash, u64>, DbError> {
        Ok(self.blocks.values().map(|b| (b.hash, b.height)).collect())
    }

    async fn creators(&mut self) -> Result<CreatorDirectory, DbError> {
        Ok(self.creators.clone())
    }

    async fn upsert_block(&mut self, block: &BlockRow) -> Result<(), DbError> {
        self.blocks.insert(block.height, *block);
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<bool, DbError> {
        if self.payments.contains_key(&payment.txid) {
            return Ok(false);
        }
        self.payments.insert(payment.txid, payment.clone());
        Ok(true)
    }

    async fn rollback_above(&mut self, height: u64) -> Result<(), DbError> {
        self.blocks.retain(|h, _| *h <= height);
        self.payments.retain(|_, p| p.block_height <= height);
        Ok(())
    }

    async fn prune_blocks_below(&mut self, height: u64) -> Result<(), DbError> {
        self.blocks.retain(|h, _| *h >= height);
        Ok(())
    }
}

/// A node that knows about every block we give it, and considers the last one given at
/// each height to be part of the best chain.
#[derive(Debug, Default)]
pub struct MockChain {
    blocks: HashMap<BlockHash, NormalizedBlock>,
    txs: HashMap<Txid, NormalizedTx>,
    best: BTreeMap<u64, BlockHash>,
    pub fetched_blocks: usize,
}

impl MockChain {
    pub fn add_block(
        &mut self,
        branch: u8,
        height: u64,
        parent_hash: BlockHash,
        txs: Vec<NormalizedTx>,
    ) -> NormalizedBlock {
        let block = NormalizedBlock {
            height,
            hash: block_hash(branch, height),
            parent_hash,
            time: 1_600_000_000 + height as i64 * 600,
            txids: txs.iter().map(|tx| tx.txid).collect(),
        };
        for tx in txs {
            self.txs.insert(tx.txid, tx);
        }
        self.blocks.insert(block.hash, block.clone());
        self.best.insert(height, block.hash);
        block
    }

    pub fn set_block_time(&mut self, hash: &BlockHash, time: i64) {
        if let Some(block) = self.blocks.get_mut(hash) {
            block.time = time;
        }
    }

    /// Blocks `from..=to` on this branch, the first one building on `parent_hash`.
    pub fn add_branch(
        &mut self,
        branch: u8,
        from: u64,
        to: u64,
        parent_hash: BlockHash,
    ) -> Vec<NormalizedBlock> {
        let mut parent = parent_hash;
        (from..=to)
            .map(|height| {
                let block = self.add_block(branch, height, parent, vec![]);
                parent = block.hash;
                block
            })
            .collect()
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn fetch_block(&mut self, block: BlockRef) -> Result<NormalizedBlock, FetchError> {
        self.fetched_blocks += 1;
        let hash = match block {
            BlockRef::Hash(hash) => hash,
            BlockRef::Height(height) => *self
                .best
                .get(&height)
                .ok_or_else(|| FetchError::NotFound(block.to_string()))?,
        };
        self.blocks
            .get(&hash)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(hash.to_string()))
    }

    async fn fetch_transaction(&mut self, txid: &Txid) -> Result<NormalizedTx, FetchError> {
        self.txs
            .get(txid)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(txid.to_string()))
    }

    async fn best_height(&mut self) -> Result<u64, FetchError> {
        self.best
            .keys()
            .next_back()
            .cloned()
            .ok_or_else(|| FetchError::Unavailable("empty chain".to_string()))
    }
}

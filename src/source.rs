//! What we need to know about the chain, independently of where it comes from.

use bitcoin::{BlockHash, Txid};

use std::fmt;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Hash(BlockHash),
    Height(u64),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Hash(h) => write!(f, "{}", h),
            Self::Height(h) => write!(f, "height {}", h),
        }
    }
}

/// A block as we index it: its position and the transactions it contains, by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBlock {
    pub height: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    /// Unix timestamp from the header
    pub time: i64,
    pub txids: Vec<Txid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value_sats: u64,
    pub script: Vec<u8>,
    /// The destination, if the provider could resolve one (OP_RETURNs don't have one).
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTx {
    pub txid: Txid,
    pub outputs: Vec<TxOutput>,
    /// Address spent by the first input, when known.
    pub sender_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeout, connection failure, or retries exhausted. Worth trying again later.
    Unavailable(String),
    /// The provider doesn't know this block or transaction. It may have been reorged out.
    NotFound(String),
    /// The provider failed our request, or answered something we could not make sense
    /// of. Retrying won't help.
    Provider(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "Chain data provider unavailable: {}", e),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Provider(e) => write!(f, "Chain data provider error: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

#[async_trait]
pub trait ChainSource: Send {
    async fn fetch_block(&mut self, block: BlockRef) -> Result<NormalizedBlock, FetchError>;

    async fn fetch_transaction(&mut self, txid: &Txid) -> Result<NormalizedTx, FetchError>;

    /// All the transactions of a block, in block order.
    async fn fetch_transactions(
        &mut self,
        block: &NormalizedBlock,
    ) -> Result<Vec<NormalizedTx>, FetchError> {
        let mut txs = Vec::with_capacity(block.txids.len());
        for txid in block.txids.iter() {
            txs.push(self.fetch_transaction(txid).await?);
        }
        Ok(txs)
    }

    /// Height of the best block the provider knows about.
    async fn best_height(&mut self) -> Result<u64, FetchError>;
}

//! Keeps our chain state in sync with the node's best chain, one block announcement at a
//! time, and records the payments it contains.
//!
//! Our chain state is a single chain of blocks, at most one per height. An announced block
//! either builds on our tip, in which case we just apply it, or it doesn't. In the latter
//! case we walk the new chain backward from the announced block until we meet a block we
//! have (the fork point), roll back everything above the fork point and apply the walked
//! blocks oldest first. Data from the abandoned chain is gone before the first new block
//! is applied.

use crate::{
    attribution::attribute,
    db::{BlockRow, ChainStore, DbError, Payment},
    notify::{Notifier, PaymentEvent},
    source::{BlockRef, ChainSource, FetchError, NormalizedBlock},
};
use bitcoin::BlockHash;

use std::{collections::HashMap, fmt};

use chrono::{TimeZone, Utc};

/// How many blocks we fetch at most while looking for a fork point.
pub const DEFAULT_MAX_REORG_DEPTH: u64 = 200;

#[derive(Debug)]
pub enum IndexerError {
    Fetch(FetchError),
    Db(DbError),
    /// We walked back this many blocks from the announced one without meeting our chain.
    /// Needs an operator to resync.
    DeepReorgExceeded { tip_height: u64, depth: u64 },
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "Fetching chain data: {}", e),
            Self::Db(e) => write!(f, "Database error: {}", e),
            Self::DeepReorgExceeded { tip_height, depth } => write!(
                f,
                "Could not find a common ancestor within {} blocks of the announced block (our tip is at height {}). A full resync is needed.",
                depth, tip_height
            ),
        }
    }
}

impl std::error::Error for IndexerError {}

impl From<FetchError> for IndexerError {
    fn from(e: FetchError) -> Self {
        Self::Fetch(e)
    }
}

impl From<DbError> for IndexerError {
    fn from(e: DbError) -> Self {
        Self::Db(e)
    }
}

pub struct Indexer<S, C> {
    store: S,
    source: C,
    notifier: Notifier,
    max_reorg_depth: u64,
    retain_blocks: Option<u64>,
}

impl<S: ChainStore, C: ChainSource> Indexer<S, C> {
    pub fn new(store: S, source: C, notifier: Notifier) -> Self {
        Indexer {
            store,
            source,
            notifier,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            retain_blocks: None,
        }
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    /// Only keep that many blocks in the chain state, pruning the older ones.
    pub fn retain_blocks(mut self, retain: Option<u64>) -> Self {
        self.retain_blocks = retain;
        self
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub fn source(&self) -> &C {
        &self.source
    }

    #[cfg(test)]
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Process a new block announcement.
    ///
    /// If the node doesn't know about a block we need anymore, it was probably reorged out
    /// under our feet. We'll reconsider our state on the next announcement.
    pub async fn process_block(&mut self, hash: BlockHash) -> Result<(), IndexerError> {
        let res = match self.source.fetch_block(BlockRef::Hash(hash)).await {
            Ok(block) => self.handle_block(block).await,
            Err(e) => Err(e.into()),
        };

        match res {
            Err(IndexerError::Fetch(FetchError::NotFound(what))) => {
                log::warn!(
                    "Chain data for block '{}' vanished ({}), waiting for the next block.",
                    hash,
                    what
                );
                Ok(())
            }
            res => res,
        }
    }

    /// Get up to date with the node. To be called once at startup, before listening to
    /// announcements.
    pub async fn catch_up(&mut self) -> Result<(), IndexerError> {
        let tip = match self.store.tip().await? {
            Some(tip) => tip,
            None => {
                log::info!("No chain state yet, starting from the next announced block.");
                return Ok(());
            }
        };

        // We might have stopped after storing the tip but before storing all its payments.
        match self.source.fetch_block(BlockRef::Hash(tip.hash)).await {
            Ok(block) => self.apply(&block).await?,
            Err(FetchError::NotFound(_)) => {
                log::warn!("Our tip '{}' is unknown to the node.", tip.hash)
            }
            Err(e) => return Err(e.into()),
        }

        let best_height = self.source.best_height().await?;
        if best_height > tip.height {
            log::info!(
                "Catching up from height {} to height {}",
                tip.height,
                best_height
            );
        }
        for height in tip.height + 1..=best_height {
            let res = match self.source.fetch_block(BlockRef::Height(height)).await {
                Ok(block) => self.handle_block(block).await,
                Err(e) => Err(e.into()),
            };

            match res {
                // The node's chain got shorter under our feet.
                Err(IndexerError::Fetch(FetchError::NotFound(what))) => {
                    log::warn!(
                        "Chain data at height {} vanished ({}), stopping catch up here.",
                        height,
                        what
                    );
                    break;
                }
                res => res?,
            }
        }

        Ok(())
    }

    async fn handle_block(&mut self, block: NormalizedBlock) -> Result<(), IndexerError> {
        let tip = match self.store.tip().await? {
            Some(tip) => tip,
            None => {
                log::info!(
                    "Starting with block '{}' at height {}",
                    block.hash,
                    block.height
                );
                return self.apply(&block).await;
            }
        };

        if block.parent_hash == tip.hash {
            return self.apply(&block).await;
        }

        let index = self.store.block_index().await?;
        if index.get(&block.hash) == Some(&block.height) {
            log::debug!(
                "Already have block '{}' at height {}",
                block.hash,
                block.height
            );
            return Ok(());
        }

        let (fork_height, segment) = self.find_fork(block, &index, &tip).await?;
        if fork_height < tip.height {
            log::info!(
                "Reorg: rolling back {} block(s) above height {}, applying {} new block(s)",
                tip.height - fork_height,
                fork_height,
                segment.len()
            );
        } else {
            log::info!(
                "Filling a gap of {} block(s) above height {}",
                segment.len().saturating_sub(1),
                fork_height
            );
        }

        self.store.rollback_above(fork_height).await?;
        for block in segment.iter() {
            self.apply(block).await?;
        }

        Ok(())
    }

    // Walk back from the announced block until we meet our chain. Returns the height of
    // the last block both chains share and the new blocks above it, oldest first.
    //
    // If the new chain only joins ours below the oldest block we have, we can't tell where
    // it forked: resync from our oldest height.
    async fn find_fork(
        &mut self,
        announced: NormalizedBlock,
        index: &HashMap<BlockHash, u64>,
        tip: &BlockRow,
    ) -> Result<(u64, Vec<NormalizedBlock>), IndexerError> {
        let min_height = index.values().min().cloned().unwrap_or(tip.height);
        // Newest first, reversed once we know where to stop.
        let mut segment = vec![announced];

        loop {
            let (parent_hash, height) = {
                let oldest = &segment[segment.len() - 1];
                (oldest.parent_hash, oldest.height)
            };

            if let Some(fork_height) = index.get(&parent_hash).cloned() {
                segment.reverse();
                return Ok((fork_height, segment));
            }
            if height <= min_height && height > 0 {
                log::warn!(
                    "New chain diverges at or below our oldest block (height {}), resyncing from there",
                    min_height
                );
                segment.reverse();
                return Ok((height - 1, segment));
            }
            if segment.len() as u64 >= self.max_reorg_depth {
                return Err(IndexerError::DeepReorgExceeded {
                    tip_height: tip.height,
                    depth: self.max_reorg_depth,
                });
            }

            let parent = self.source.fetch_block(BlockRef::Hash(parent_hash)).await?;
            segment.push(parent);
        }
    }

    // Store this block and the payments it contains, then tell the world about them.
    async fn apply(&mut self, block: &NormalizedBlock) -> Result<(), IndexerError> {
        let confirmed_at = Utc.timestamp_opt(block.time, 0).single().ok_or_else(|| {
            FetchError::Provider(format!(
                "block '{}' has an invalid timestamp: {}",
                block.hash, block.time
            ))
        })?;
        let txs = self.source.fetch_transactions(block).await?;
        // Creators register while we run, don't use a stale set.
        let creators = self.store.creators().await?;

        let row = BlockRow {
            height: block.height,
            hash: block.hash,
            parent_hash: block.parent_hash,
        };
        self.store.upsert_block(&row).await?;

        let mut recorded = 0;
        for tx in txs.iter() {
            let candidate = match attribute(tx, &creators) {
                Some(c) => c,
                None => continue,
            };
            let payment = Payment::confirmed(candidate, &row, confirmed_at);
            if self.store.insert_payment(&payment).await? {
                log::info!(
                    "Recorded payment of {} sats to creator '{}' in tx '{}'",
                    payment.amount_sats,
                    payment.creator_id,
                    payment.txid
                );
                self.notifier.emit(PaymentEvent::from(&payment));
                recorded += 1;
            } else {
                log::debug!("Payment in tx '{}' was already recorded", payment.txid);
            }
        }

        if let Some(retain) = self.retain_blocks {
            if block.height >= retain {
                self.store
                    .prune_blocks_below(block.height + 1 - retain)
                    .await?;
            }
        }

        log::info!(
            "Applied block '{}' at height {} ({} transactions, {} new payments)",
            block.hash,
            block.height,
            txs.len(),
            recorded
        );
        Ok(())
    }
}

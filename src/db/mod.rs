mod schema;
use crate::{
    attribution::{CreatorDirectory, PaymentCandidate},
    payload::CreatorId,
};
use bitcoin::{hashes::hex::FromHex, BlockHash, Txid};
use schema::SCHEMA;

use std::{collections::HashMap, fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{types::Type, Client, NoTls, Transaction};

#[derive(Debug)]
pub enum DbError {
    /// An error originating from the Postgres backend
    Postgres(tokio_postgres::Error),
    /// We read back something we could not have written
    Corrupted(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Postgres(e) => write!(f, "{}", e),
            Self::Corrupted(s) => write!(f, "Unexpected database content: {}", s),
        }
    }
}

impl std::error::Error for DbError {}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Postgres(e)
    }
}

/// A row of the blocks table. There is at most one per height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRow {
    pub height: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
}

/// A row of the payments table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub txid: Txid,
    pub creator_id: CreatorId,
    pub payment_type: u8,
    pub content_id: Option<u32>,
    pub sender_address: Option<String>,
    pub amount_sats: u64,
    pub payload_hex: String,
    pub block_height: u64,
    pub block_hash: BlockHash,
    pub confirmed_at: DateTime<Utc>,
}

impl Payment {
    pub fn confirmed(
        candidate: PaymentCandidate,
        block: &BlockRow,
        confirmed_at: DateTime<Utc>,
    ) -> Payment {
        Payment {
            txid: candidate.txid,
            creator_id: candidate.creator_id,
            payment_type: candidate.payment_type,
            content_id: Some(candidate.content_id),
            sender_address: candidate.sender_address,
            amount_sats: candidate.amount_sats,
            payload_hex: candidate.payload_hex,
            block_height: block.height,
            block_hash: block.hash,
            confirmed_at,
        }
    }
}

/// Our view of the best chain and the payments it contains.
///
/// Callers are serialized (one block at a time), implementations don't need to lock.
#[async_trait]
pub trait ChainStore: Send {
    /// The highest block we have, if any.
    async fn tip(&mut self) -> Result<Option<BlockRow>, DbError>;

    /// Every stored block hash, with its height.
    async fn block_index(&mut self) -> Result<HashMap<BlockHash, u64>, DbError>;

    /// The current creators and their addresses. Never cached.
    async fn creators(&mut self) -> Result<CreatorDirectory, DbError>;

    /// Insert this block, replacing whatever we had at its height.
    async fn upsert_block(&mut self, block: &BlockRow) -> Result<(), DbError>;

    /// Returns `false` if a payment for this txid was already there, in which case
    /// nothing was changed.
    async fn insert_payment(&mut self, payment: &Payment) -> Result<bool, DbError>;

    /// Forget about all blocks and payments above this height, atomically.
    async fn rollback_above(&mut self, height: u64) -> Result<(), DbError>;

    /// Forget about blocks below this height. Payments are kept.
    async fn prune_blocks_below(&mut self, height: u64) -> Result<(), DbError>;
}

async fn establish_connection(
    config: &tokio_postgres::Config,
) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = config.connect(NoTls).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("Database connection error: {}", e);
        }
    });

    Ok(client)
}

pub async fn maybe_create_db(config: &tokio_postgres::Config) -> Result<(), tokio_postgres::Error> {
    let client = establish_connection(config).await?;

    client.batch_execute(SCHEMA).await?;

    Ok(())
}

fn hash_from_row<T: FromHex>(hex: &str) -> Result<T, DbError> {
    T::from_hex(hex).map_err(|e| DbError::Corrupted(format!("invalid hash '{}': {}", hex, e)))
}

async fn delete_blocks_above(db_tx: &Transaction<'_>, height: u64) -> Result<u64, DbError> {
    let statement = db_tx
        .prepare_typed("DELETE FROM blocks WHERE height > $1", &[Type::INT8])
        .await?;
    Ok(db_tx.execute(&statement, &[&(height as i64)]).await?)
}

async fn delete_payments_above_height(
    db_tx: &Transaction<'_>,
    height: u64,
) -> Result<u64, DbError> {
    let statement = db_tx
        .prepare_typed("DELETE FROM payments WHERE block_height > $1", &[Type::INT8])
        .await?;
    Ok(db_tx.execute(&statement, &[&(height as i64)]).await?)
}

/// A single connection to the Postgres database, kept for the lifetime of the indexer.
pub struct DbConnection {
    client: Client,
}

impl DbConnection {
    pub async fn new(config: &tokio_postgres::Config) -> Result<DbConnection, DbError> {
        let client = establish_connection(config).await?;
        Ok(DbConnection { client })
    }
}

#[async_trait]
impl ChainStore for DbConnection {
    async fn tip(&mut self) -> Result<Option<BlockRow>, DbError> {
        let statement = self
            .client
            .prepare(
                "SELECT height, block_hash, parent_hash FROM blocks ORDER BY height DESC LIMIT 1",
            )
            .await?;

        match self.client.query_opt(&statement, &[]).await? {
            Some(row) => {
                let height: i64 = row.get(0);
                let hash: &str = row.get(1);
                let parent_hash: &str = row.get(2);
                Ok(Some(BlockRow {
                    height: height as u64,
                    hash: hash_from_row(hash)?,
                    parent_hash: hash_from_row(parent_hash)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn block_index(&mut self) -> Result<HashMap<BlockHash, u64>, DbError> {
        let statement = self
            .client
            .prepare("SELECT height, block_hash FROM blocks")
            .await?;

        let mut index = HashMap::new();
        for row in self.client.query(&statement, &[]).await? {
            let height: i64 = row.get(0);
            let hash: &str = row.get(1);
            index.insert(hash_from_row(hash)?, height as u64);
        }

        Ok(index)
    }

    async fn creators(&mut self) -> Result<CreatorDirectory, DbError> {
        let statement = self
            .client
            .prepare("SELECT creator_id, contract_address FROM creators")
            .await?;

        let mut directory = CreatorDirectory::new();
        for row in self.client.query(&statement, &[]).await? {
            let creator_id: &str = row.get(0);
            let address: String = row.get(1);
            match CreatorId::from_str(creator_id) {
                Ok(id) => directory.insert(id, address),
                // Not ours to fix, and it can't match any payload anyways
                Err(e) => log::warn!("Ignoring creator '{}': {}", creator_id, e),
            }
        }

        Ok(directory)
    }

    async fn upsert_block(&mut self, block: &BlockRow) -> Result<(), DbError> {
        let statement = self
            .client
            .prepare_typed(
                "INSERT INTO blocks (height, block_hash, parent_hash) VALUES ($1, $2, $3) \
                 ON CONFLICT (height) DO UPDATE \
                 SET block_hash = EXCLUDED.block_hash, parent_hash = EXCLUDED.parent_hash",
                &[Type::INT8, Type::TEXT, Type::TEXT],
            )
            .await?;
        self.client
            .execute(
                &statement,
                &[
                    &(block.height as i64),
                    &block.hash.to_string(),
                    &block.parent_hash.to_string(),
                ],
            )
            .await?;

        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<bool, DbError> {
        let statement = self
            .client
            .prepare_typed(
                "INSERT INTO payments (txid, creator_id, payment_type, content_id, \
                 sender_address, amount_sats, payload_hex, block_height, block_hash, \
                 confirmed_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (txid) DO NOTHING",
                &[
                    Type::TEXT,
                    Type::TEXT,
                    Type::INT2,
                    Type::INT8,
                    Type::TEXT,
                    Type::INT8,
                    Type::TEXT,
                    Type::INT8,
                    Type::TEXT,
                    Type::TIMESTAMPTZ,
                ],
            )
            .await?;
        let inserted = self
            .client
            .execute(
                &statement,
                &[
                    &payment.txid.to_string(),
                    &payment.creator_id.to_string(),
                    &(payment.payment_type as i16),
                    &payment.content_id.map(|c| c as i64),
                    &payment.sender_address,
                    &(payment.amount_sats as i64),
                    &payment.payload_hex,
                    &(payment.block_height as i64),
                    &payment.block_hash.to_string(),
                    &payment.confirmed_at,
                ],
            )
            .await?;

        Ok(inserted == 1)
    }

    async fn rollback_above(&mut self, height: u64) -> Result<(), DbError> {
        let db_tx = self.client.transaction().await?;
        let blocks = delete_blocks_above(&db_tx, height).await?;
        let payments = delete_payments_above_height(&db_tx, height).await?;
        db_tx.commit().await?;

        log::debug!(
            "Rolled back {} blocks and {} payments above height {}",
            blocks,
            payments,
            height
        );
        Ok(())
    }

    async fn prune_blocks_below(&mut self, height: u64) -> Result<(), DbError> {
        let statement = self
            .client
            .prepare_typed("DELETE FROM blocks WHERE height < $1", &[Type::INT8])
            .await?;
        self.client
            .execute(&statement, &[&(height as i64)])
            .await?;

        Ok(())
    }
}

//! Receive block announcements from the node and feed them to the indexer, one at a time.

use crate::{
    db::ChainStore,
    indexer::{Indexer, IndexerError},
    source::ChainSource,
};
use bitcoin::{hashes::Hash, BlockHash};

use std::fmt;

use async_trait::async_trait;
use zeromq::{Socket, SocketRecv, SubSocket, ZmqError};

/// The topic bitcoind publishes new block hashes on.
pub const DEFAULT_TOPIC: &str = "hashblock";

#[derive(Debug)]
pub enum IngestError {
    Subscription(ZmqError),
    Indexer(IndexerError),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Subscription(e) => write!(f, "Block announcements subscription: {}", e),
            Self::Indexer(e) => write!(f, "Indexing: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<ZmqError> for IngestError {
    fn from(e: ZmqError) -> Self {
        Self::Subscription(e)
    }
}

impl From<IndexerError> for IngestError {
    fn from(e: IndexerError) -> Self {
        Self::Indexer(e)
    }
}

/// A feed of new block hashes.
#[async_trait]
pub trait BlockAnnouncements: Send {
    async fn next_block(&mut self) -> Result<BlockHash, IngestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub hash: BlockHash,
    /// Per-topic message counter, if the publisher sent one.
    pub sequence: Option<u32>,
}

/// Parse a multipart message as published by bitcoind: the topic, the block hash (in the
/// usual reversed display order) and a little-endian sequence number.
///
/// Returns None for other topics and for anything not shaped like a block announcement.
pub fn parse_announcement(topic: &str, frames: &[Vec<u8>]) -> Option<Announcement> {
    if frames.first()?.as_slice() != topic.as_bytes() {
        return None;
    }

    let hash_frame = frames.get(1)?;
    if hash_frame.len() != 32 {
        return None;
    }
    let mut inner = [0u8; 32];
    inner.copy_from_slice(hash_frame);
    inner.reverse();

    let sequence = frames
        .get(2)
        .filter(|seq| seq.len() == 4)
        .map(|seq| u32::from_le_bytes([seq[0], seq[1], seq[2], seq[3]]));

    Some(Announcement {
        hash: BlockHash::from_inner(inner),
        sequence,
    })
}

pub struct ZmqSubscriber {
    socket: SubSocket,
    topic: String,
    last_sequence: Option<u32>,
}

impl ZmqSubscriber {
    pub async fn connect(endpoint: &str, topic: &str) -> Result<ZmqSubscriber, IngestError> {
        let mut socket = SubSocket::new();
        socket.connect(endpoint).await?;
        socket.subscribe(topic).await?;
        log::info!("Subscribed to '{}' announcements at '{}'", topic, endpoint);

        Ok(ZmqSubscriber {
            socket,
            topic: topic.to_string(),
            last_sequence: None,
        })
    }

    // Announcements can get dropped by the publisher under load. We'll fill the gap on the
    // next block anyway, but it's worth knowing.
    fn check_sequence(&mut self, sequence: Option<u32>) {
        if let (Some(last), Some(seq)) = (self.last_sequence, sequence) {
            if seq != last.wrapping_add(1) {
                log::warn!(
                    "Missed {} block announcement(s) (sequence {} after {})",
                    seq.wrapping_sub(last).wrapping_sub(1),
                    seq,
                    last
                );
            }
        }
        if sequence.is_some() {
            self.last_sequence = sequence;
        }
    }
}

#[async_trait]
impl BlockAnnouncements for ZmqSubscriber {
    async fn next_block(&mut self) -> Result<BlockHash, IngestError> {
        loop {
            let msg = self.socket.recv().await?;
            let frames: Vec<Vec<u8>> = msg.into_vec().iter().map(|f| f.to_vec()).collect();

            match parse_announcement(&self.topic, &frames) {
                Some(announcement) => {
                    self.check_sequence(announcement.sequence);
                    log::debug!("Block '{}' announced", announcement.hash);
                    return Ok(announcement.hash);
                }
                None => log::trace!(
                    "Ignoring a {}-part message that isn't a '{}' announcement",
                    frames.len(),
                    self.topic
                ),
            }
        }
    }
}

/// Process announcements until something goes wrong. Never returns Ok.
pub async fn run<S, C, A>(
    indexer: &mut Indexer<S, C>,
    announcements: &mut A,
) -> Result<(), IngestError>
where
    S: ChainStore,
    C: ChainSource,
    A: BlockAnnouncements,
{
    loop {
        let hash = announcements.next_block().await?;
        indexer.process_block(hash).await?;
    }
}

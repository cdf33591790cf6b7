use crate::{db::Payment, payload::CreatorId};
use bitcoin::{BlockHash, Txid};

use serde::Serialize;
use tokio::sync::broadcast;

// Listeners lagging behind by more than this start losing events.
const CHANNEL_CAPACITY: usize = 1024;

/// A payment was confirmed in the best chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub txid: Txid,
    pub creator_id: CreatorId,
    pub payment_type: u8,
    pub content_id: Option<u32>,
    pub amount_sats: u64,
    pub block_height: u64,
    pub block_hash: BlockHash,
}

impl From<&Payment> for PaymentEvent {
    fn from(payment: &Payment) -> Self {
        PaymentEvent {
            txid: payment.txid,
            creator_id: payment.creator_id,
            payment_type: payment.payment_type,
            content_id: payment.content_id,
            amount_sats: payment.amount_sats,
            block_height: payment.block_height,
            block_hash: payment.block_hash,
        }
    }
}

/// Fans out payment events to whoever listens (websocket broadcaster, webhooks, ..).
///
/// Sending never blocks nor fails: a listener too slow to keep up misses events, and
/// nobody listening is fine.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<PaymentEvent>,
}

impl Notifier {
    pub fn new() -> Notifier {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Notifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaymentEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: PaymentEvent) {
        if self.sender.send(event).is_err() {
            log::trace!("No listener for payment events");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Log every payment we see. Returns once the notifier is gone.
pub async fn log_payments(mut receiver: broadcast::Receiver<PaymentEvent>) {
    loop {
        match receiver.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => log::info!("Payment observed: {}", json),
                Err(e) => log::error!("Serializing payment event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Payment logger lagging, missed {} events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

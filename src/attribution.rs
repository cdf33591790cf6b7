//! Figure out whether a transaction pays one of our creators.

use crate::{
    payload::{decode_script, CreatorId, Payload, PaymentType},
    source::NormalizedTx,
};
use bitcoin::{hashes::hex::ToHex, Txid};

use std::collections::{HashMap, HashSet};

/// Creators and the contract address they currently receive payments at. Reloaded
/// before each block, as creators get registered while we run.
#[derive(Debug, Clone, Default)]
pub struct CreatorDirectory {
    addresses: HashMap<CreatorId, String>,
    // Every address in `addresses`, for output lookups
    tracked: HashSet<String>,
}

// Nodes give us cashaddrs with their prefix, the platform may store them without.
fn normalize_address(address: &str) -> &str {
    for prefix in ["bitcoincash:", "bchtest:", "bchreg:"].iter() {
        if let Some(stripped) = address.strip_prefix(prefix) {
            return stripped;
        }
    }
    address
}

impl CreatorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, creator_id: CreatorId, address: String) {
        let address = normalize_address(&address).to_string();
        self.tracked.insert(address.clone());

        if let Some(previous) = self.addresses.insert(creator_id, address) {
            if !self.addresses.values().any(|a| *a == previous) {
                self.tracked.remove(&previous);
            }
        }
    }

    pub fn address_of(&self, creator_id: &CreatorId) -> Option<&str> {
        self.addresses.get(creator_id).map(|a| a.as_str())
    }

    pub fn is_tracked(&self, address: &str) -> bool {
        self.tracked.contains(normalize_address(address))
    }
}

impl std::iter::FromIterator<(CreatorId, String)> for CreatorDirectory {
    fn from_iter<I: IntoIterator<Item = (CreatorId, String)>>(iter: I) -> Self {
        let mut directory = CreatorDirectory::new();
        for (creator_id, address) in iter {
            directory.insert(creator_id, address);
        }
        directory
    }
}

/// A payment we found in a transaction, before we know which block it ends up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCandidate {
    pub txid: Txid,
    pub creator_id: CreatorId,
    pub payment_type: u8,
    pub content_id: u32,
    pub sender_address: Option<String>,
    pub amount_sats: u64,
    pub payload_hex: String,
}

// Sum of the values paid to each tracked address by this transaction.
fn tracked_amounts(tx: &NormalizedTx, creators: &CreatorDirectory) -> HashMap<String, u64> {
    let mut amounts = HashMap::new();

    for output in tx.outputs.iter() {
        let address = match output.address {
            Some(ref a) => normalize_address(a),
            None => continue,
        };
        if creators.is_tracked(address) {
            *amounts.entry(address.to_string()).or_insert(0) += output.value_sats;
        }
    }

    amounts
}

/// Match the payloads of this transaction against the amounts it pays to our creators.
///
/// The creator declared in the payload decides which address we look at, not the
/// position of the outputs. Txids are unique in the payments table so there is at most one
/// payment per transaction: the first payload, in output order, that resolves to a known
/// creator actually paid by the transaction wins.
pub fn attribute(tx: &NormalizedTx, creators: &CreatorDirectory) -> Option<PaymentCandidate> {
    let payloads: Vec<Payload> = tx
        .outputs
        .iter()
        .filter_map(|output| decode_script(&output.script))
        .collect();
    if payloads.is_empty() {
        return None;
    }

    let amounts = tracked_amounts(tx, creators);

    for payload in payloads {
        if PaymentType::from_u8(payload.payment_type).is_none() {
            log::trace!(
                "Ignoring payload with unknown payment type {} in tx '{}'",
                payload.payment_type,
                tx.txid
            );
            continue;
        }

        let address = match creators.address_of(&payload.creator_id) {
            Some(a) => a,
            None => {
                log::trace!(
                    "Payload in tx '{}' for unknown creator '{}'",
                    tx.txid,
                    payload.creator_id
                );
                continue;
            }
        };
        let amount_sats = match amounts.get(address) {
            Some(a) if *a > 0 => *a,
            _ => {
                log::debug!(
                    "Tx '{}' carries a payload for creator '{}' but doesn't pay '{}'",
                    tx.txid,
                    payload.creator_id,
                    address
                );
                continue;
            }
        };

        return Some(PaymentCandidate {
            txid: tx.txid,
            creator_id: payload.creator_id,
            payment_type: payload.payment_type,
            content_id: payload.content_id,
            sender_address: tx.sender_address.clone(),
            amount_sats,
            payload_hex: payload.encode().to_hex(),
        });
    }

    None
}

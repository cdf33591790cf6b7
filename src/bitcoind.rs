use crate::{
    config::BitcoindConfig,
    source::{BlockRef, ChainSource, FetchError, NormalizedBlock, NormalizedTx, TxOutput},
};
use bitcoin::{
    hashes::{hex::FromHex, Hash},
    Amount, BlockHash, OutPoint, Txid,
};
use jsonrpc::{
    arg,
    client::Client,
    error::{Error, RpcError},
    simple_http::{Error as HttpError, SimpleHttpTransport},
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as Json;
use std::{collections::HashMap, fmt, fs, thread, time::Duration};

use async_trait::async_trait;

macro_rules! params {
    ($($param:expr),* $(,)?) => {
        [
            $(
                arg($param),
            )*
        ]
    };
}

// If the node takes more than 30 seconds to answer one of our queries, fail.
const RPC_SOCKET_TIMEOUT: u64 = 30;
// First retry after this, doubling each time.
const RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_RETRIES: u32 = 3;

// RPC_INVALID_ADDRESS_OR_KEY, what we get for an unknown block or transaction
const RPC_NOT_FOUND: i32 = -5;
// RPC_INVALID_PARAMETER, what we get for a height above the tip
const RPC_OUT_OF_RANGE: i32 = -8;
// RPC_IN_WARMUP, the node is starting
const RPC_IN_WARMUP: i32 = -28;

#[derive(Debug)]
pub enum BitcoindError {
    /// It can be related to us..
    CookieFile(std::io::Error),
    /// Or directly to the node's RPC server
    Server(Error),
    /// We could not reach the node in time, even after retrying
    Unavailable(Error),
    /// The node doesn't know about what we asked
    NotFound(String),
    /// The node answered, but not what we expected
    Malformed(String),
    BatchMissingResponse,
}

impl fmt::Display for BitcoindError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::CookieFile(e) => write!(f, "While reading the cookie file: {}", e),
            Self::Server(e) => write!(f, "RPC server error: {}", e),
            Self::Unavailable(e) => write!(f, "Node unreachable: {}", e),
            Self::NotFound(msg) => write!(f, "Not found: {}", msg),
            Self::Malformed(msg) => write!(f, "Unexpected answer from the node: {}", msg),
            Self::BatchMissingResponse => write!(f, "Batch is missing a response"),
        }
    }
}

impl std::error::Error for BitcoindError {}

impl From<HttpError> for BitcoindError {
    fn from(e: HttpError) -> Self {
        Self::Server(Error::Transport(Box::new(e)))
    }
}

impl BitcoindError {
    // Tell apart the "I don't know this" answers from the actual failures.
    fn from_response(e: Error) -> Self {
        match e {
            Error::Rpc(RpcError { code, ref message, .. })
                if code == RPC_NOT_FOUND || code == RPC_OUT_OF_RANGE =>
            {
                Self::NotFound(message.clone())
            }
            Error::Rpc(RpcError { code, .. }) if code == RPC_IN_WARMUP => Self::Unavailable(e),
            e => Self::Server(e),
        }
    }
}

impl From<BitcoindError> for FetchError {
    fn from(e: BitcoindError) -> Self {
        match e {
            BitcoindError::Unavailable(_) | BitcoindError::BatchMissingResponse => {
                FetchError::Unavailable(e.to_string())
            }
            BitcoindError::NotFound(msg) => FetchError::NotFound(msg),
            BitcoindError::Malformed(msg) => FetchError::Provider(msg),
            BitcoindError::CookieFile(_) | BitcoindError::Server(_) => {
                FetchError::Provider(e.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: BlockHash,
    height: u64,
    // Absent for the genesis block
    previousblockhash: Option<BlockHash>,
    time: i64,
    tx: Vec<Txid>,
}

impl From<RpcBlock> for NormalizedBlock {
    fn from(block: RpcBlock) -> Self {
        NormalizedBlock {
            height: block.height,
            hash: block.hash,
            parent_hash: block
                .previousblockhash
                .unwrap_or_else(|| BlockHash::from_inner([0; 32])),
            time: block.time,
            txids: block.tx,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcScriptPubKey {
    hex: String,
    // Older nodes give a list, newer ones a single address
    #[serde(default)]
    addresses: Vec<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTxOut {
    #[serde(with = "bitcoin::util::amount::serde::as_btc")]
    value: Amount,
    script_pub_key: RpcScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct RpcTxIn {
    // Both absent for a coinbase input
    txid: Option<Txid>,
    vout: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RpcTx {
    txid: Txid,
    vin: Vec<RpcTxIn>,
    vout: Vec<RpcTxOut>,
}

impl RpcTxOut {
    fn address(&self) -> Option<String> {
        self.script_pub_key
            .address
            .clone()
            .or_else(|| self.script_pub_key.addresses.first().cloned())
    }
}

impl RpcTx {
    /// The outpoint spent by the first input, unless it's a coinbase.
    fn first_prevout(&self) -> Option<OutPoint> {
        let input = self.vin.first()?;
        Some(OutPoint {
            txid: input.txid?,
            vout: input.vout?,
        })
    }

    fn normalize(self, sender_address: Option<String>) -> Result<NormalizedTx, BitcoindError> {
        let outputs = self
            .vout
            .into_iter()
            .map(|out| {
                let script = Vec::<u8>::from_hex(&out.script_pub_key.hex).map_err(|e| {
                    BitcoindError::Malformed(format!("scriptPubKey in tx '{}': {}", self.txid, e))
                })?;
                Ok(TxOutput {
                    value_sats: out.value.as_sat(),
                    address: out.address(),
                    script,
                })
            })
            .collect::<Result<Vec<TxOutput>, BitcoindError>>()?;

        Ok(NormalizedTx {
            txid: self.txid,
            outputs,
            sender_address,
        })
    }
}

fn from_json<T: DeserializeOwned>(json: Json) -> Result<T, BitcoindError> {
    serde_json::from_value(json).map_err(|e| BitcoindError::Malformed(e.to_string()))
}

/// A connection to a Bitcoin Cash node's JSON-RPC interface, our chain data provider.
pub struct BitcoinD {
    node_client: Client,
    retries: u32,
}

impl BitcoinD {
    pub fn new(config: &BitcoindConfig) -> Result<BitcoinD, BitcoindError> {
        let builder = SimpleHttpTransport::builder()
            .url(&config.addr.to_string())
            .map_err(BitcoindError::from)?
            .timeout(Duration::from_secs(RPC_SOCKET_TIMEOUT));
        let builder = match (&config.cookie_path, &config.user, &config.password) {
            (Some(cookie_path), _, _) => {
                let cookie_string =
                    fs::read_to_string(cookie_path).map_err(BitcoindError::CookieFile)?;
                builder.cookie_auth(cookie_string)
            }
            (None, Some(user), password) => builder.auth(user, password.as_ref()),
            (None, None, _) => builder,
        };

        Ok(BitcoinD {
            node_client: Client::with_transport(builder.build()),
            retries: config.retries.unwrap_or(DEFAULT_RETRIES),
        })
    }

    // Reasonably try to be robust to possible spurious communication error.
    fn handle_error(&self, e: Error, attempt: u32) -> Result<(), BitcoindError> {
        match e {
            Error::Transport(ref err) => {
                log::error!("Transport error when talking to the node: '{}'", err);

                // Rule out the error that can not be fixed by retrying, we better be failing
                // quickly.
                if let Some(HttpError::InvalidUrl { .. }) = err.downcast_ref::<HttpError>() {
                    return Err(BitcoindError::Server(e));
                }

                // This one *may* happen. For a number of reasons, the obvious one may
                // be the RPC work queue being exceeded, or the node restarting.
                if attempt >= self.retries {
                    return Err(BitcoindError::Unavailable(e));
                }
            }
            Error::Json(ref err) => {
                // Weird. A JSON serialization error? Just try again but
                // fail fast anyways as it should not happen.
                log::error!(
                    "JSON serialization error when talking to the node: '{}'",
                    err
                );
                if attempt >= 1 {
                    return Err(BitcoindError::Server(e));
                }
            }
            _ => return Err(BitcoindError::Server(e)),
        };

        self.backoff(attempt);
        Ok(())
    }

    // The node answered, but it is not ready to serve us (eg still loading its block
    // index after a restart).
    fn handle_unavailable(&self, e: Error, attempt: u32) -> Result<(), BitcoindError> {
        log::debug!("Node not ready yet: '{}'", e);
        if attempt >= self.retries {
            return Err(BitcoindError::Unavailable(e));
        }

        self.backoff(attempt);
        Ok(())
    }

    fn backoff(&self, attempt: u32) {
        let backoff = Duration::from_millis(RETRY_BACKOFF_MS << attempt.min(10));
        thread::sleep(backoff);
        log::debug!("Retrying RPC request to the node (attempt {}).", attempt + 1);
    }

    fn make_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[Box<serde_json::value::RawValue>],
    ) -> Result<T, BitcoindError> {
        let mut attempt = 0;
        loop {
            let req = self.node_client.build_request(method, params);
            log::trace!("Sending to the node: {:?}", req);
            match self.node_client.send_request(req) {
                Ok(resp) => match resp.result().map_err(BitcoindError::from_response) {
                    Err(BitcoindError::Unavailable(e)) => self.handle_unavailable(e, attempt)?,
                    res => return res,
                },
                // Decide wether we should error, or not yet
                Err(e) => self.handle_error(e, attempt)?,
            }
            attempt += 1;
        }
    }

    fn make_requests(
        &self,
        reqs: &[jsonrpc::Request],
    ) -> Result<Vec<Result<Json, BitcoindError>>, BitcoindError> {
        if reqs.is_empty() {
            return Ok(Vec::new());
        }
        log::trace!("Sending a batch of {} requests to the node", reqs.len());

        let mut attempt = 0;
        loop {
            match self.node_client.send_batch(reqs) {
                Ok(resp) => {
                    let res = resp
                        .into_iter()
                        .flatten()
                        .map(|resp| resp.result().map_err(BitcoindError::from_response))
                        .collect::<Vec<Result<Json, BitcoindError>>>();

                    if res.len() != reqs.len() {
                        return Err(BitcoindError::BatchMissingResponse);
                    }

                    // If the node isn't ready for one of them, send them all again.
                    let mut unavailable = None;
                    let mut results = Vec::with_capacity(res.len());
                    for r in res {
                        match r {
                            Err(BitcoindError::Unavailable(e)) => unavailable = Some(e),
                            r => results.push(r),
                        }
                    }
                    match unavailable {
                        Some(e) => self.handle_unavailable(e, attempt)?,
                        None => return Ok(results),
                    }
                }
                Err(e) => self.handle_error(e, attempt)?,
            }
            attempt += 1;
        }
    }

    pub fn block_hash(&self, height: u64) -> Result<BlockHash, BitcoindError> {
        self.make_request("getblockhash", &params!(height))
    }

    pub fn block_count(&self) -> Result<u64, BitcoindError> {
        self.make_request("getblockcount", &[])
    }

    pub fn block(&self, block: BlockRef) -> Result<NormalizedBlock, BitcoindError> {
        let hash = match block {
            BlockRef::Hash(hash) => hash,
            BlockRef::Height(height) => self.block_hash(height)?,
        };
        let block: RpcBlock = self.make_request("getblock", &params!(hash.to_string(), 1))?;
        Ok(block.into())
    }

    // Best effort: a failure here only costs us the sender address.
    fn addresses_of(&self, outpoints: &[OutPoint]) -> HashMap<OutPoint, String> {
        let params: Vec<[Box<serde_json::value::RawValue>; 2]> = outpoints
            .iter()
            .map(|o| params!(o.txid.to_string(), true))
            .collect();
        let reqs: Vec<jsonrpc::Request> = params
            .iter()
            .map(|p| self.node_client.build_request("getrawtransaction", p.as_ref()))
            .collect();

        let results = match self.make_requests(&reqs) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("Could not fetch previous transactions: {}", e);
                return HashMap::new();
            }
        };

        outpoints
            .iter()
            .zip(results)
            .filter_map(|(outpoint, res)| {
                let prev_tx: RpcTx = res.and_then(from_json).ok()?;
                let address = prev_tx.vout.get(outpoint.vout as usize)?.address()?;
                Some((*outpoint, address))
            })
            .collect()
    }

    fn normalize_with_senders(&self, txs: Vec<RpcTx>) -> Result<Vec<NormalizedTx>, BitcoindError> {
        let prevouts: Vec<OutPoint> = txs.iter().filter_map(|tx| tx.first_prevout()).collect();
        let senders = self.addresses_of(&prevouts);

        txs.into_iter()
            .map(|tx| {
                let sender = tx
                    .first_prevout()
                    .and_then(|o| senders.get(&o).cloned());
                tx.normalize(sender)
            })
            .collect()
    }

    pub fn transaction(&self, txid: &Txid) -> Result<NormalizedTx, BitcoindError> {
        let tx: RpcTx = self.make_request("getrawtransaction", &params!(txid.to_string(), true))?;
        Ok(self.normalize_with_senders(vec![tx])?.remove(0))
    }

    /// Get all the transactions of this block in a single batch. Giving the block hash lets
    /// the node find them without a transaction index.
    pub fn block_transactions(
        &self,
        block: &NormalizedBlock,
    ) -> Result<Vec<NormalizedTx>, BitcoindError> {
        let params: Vec<[Box<serde_json::value::RawValue>; 3]> = block
            .txids
            .iter()
            .map(|txid| params!(txid.to_string(), true, block.hash.to_string()))
            .collect();
        let reqs: Vec<jsonrpc::Request> = params
            .iter()
            .map(|p| self.node_client.build_request("getrawtransaction", p.as_ref()))
            .collect();

        let txs = self
            .make_requests(&reqs)?
            .into_iter()
            .map(|res| res.and_then(from_json))
            .collect::<Result<Vec<RpcTx>, BitcoindError>>()?;

        self.normalize_with_senders(txs)
    }
}

// The JSON-RPC client is blocking, so is every call to the node. Don't hold the runtime
// worker hostage meanwhile (this needs the multi-threaded runtime).
#[async_trait]
impl ChainSource for BitcoinD {
    async fn fetch_block(&mut self, block: BlockRef) -> Result<NormalizedBlock, FetchError> {
        tokio::task::block_in_place(|| self.block(block)).map_err(FetchError::from)
    }

    async fn fetch_transaction(&mut self, txid: &Txid) -> Result<NormalizedTx, FetchError> {
        tokio::task::block_in_place(|| self.transaction(txid)).map_err(FetchError::from)
    }

    async fn fetch_transactions(
        &mut self,
        block: &NormalizedBlock,
    ) -> Result<Vec<NormalizedTx>, FetchError> {
        tokio::task::block_in_place(|| self.block_transactions(block)).map_err(FetchError::from)
    }

    async fn best_height(&mut self) -> Result<u64, FetchError> {
        tokio::task::block_in_place(|| self.block_count()).map_err(FetchError::from)
    }
}

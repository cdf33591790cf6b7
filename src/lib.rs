pub mod attribution;
pub mod bitcoind;
pub mod config;
pub mod db;
pub mod indexer;
pub mod indexerd;
pub mod ingest;
pub mod notify;
pub mod payload;
pub mod source;

#[cfg(test)]
mod testutils;

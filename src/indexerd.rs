use crate::{
    config::{datadir_path, BitcoindConfig, Config, ConfigError},
    indexer::DEFAULT_MAX_REORG_DEPTH,
    ingest::DEFAULT_TOPIC,
};

use std::{fs, os::unix::fs::DirBuilderExt, path::PathBuf, str::FromStr};

/// Our global state, everything the daemon needs to run once the configuration was read
pub struct IndexerD {
    // Misc daemon stuff
    pub data_dir: PathBuf,
    pub daemon: bool,

    pub postgres_config: tokio_postgres::Config,
    pub bitcoind_config: BitcoindConfig,

    // Where and what to listen to for new blocks
    pub zmq_endpoint: String,
    pub zmq_topic: String,

    pub max_reorg_depth: u64,
    pub retain_blocks: Option<u64>,
}

fn create_datadir(datadir_path: &PathBuf) -> Result<(), std::io::Error> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o700).recursive(true).create(datadir_path)
}

impl IndexerD {
    pub fn from_config(config: Config) -> Result<IndexerD, Box<dyn std::error::Error>> {
        let mut data_dir = match config.data_dir {
            Some(dir) => dir,
            None => datadir_path()?,
        };
        if !data_dir.as_path().exists() {
            if let Err(e) = create_datadir(&data_dir) {
                return Err(Box::from(ConfigError(format!(
                    "Could not create data dir '{:?}': {}.",
                    data_dir, e
                ))));
            }
        }
        data_dir = fs::canonicalize(data_dir)?;
        let daemon = config.daemon.unwrap_or(false);

        let postgres_config = tokio_postgres::Config::from_str(&config.postgres_uri)?;

        Ok(IndexerD {
            data_dir,
            daemon,
            postgres_config,
            bitcoind_config: config.bitcoind,
            zmq_endpoint: config.zmq_endpoint,
            zmq_topic: config
                .zmq_topic
                .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            max_reorg_depth: config.max_reorg_depth.unwrap_or(DEFAULT_MAX_REORG_DEPTH),
            retain_blocks: config.retain_blocks,
        })
    }

    fn file_from_datadir(&self, file_name: &str) -> PathBuf {
        let mut path = self.data_dir.clone();
        path.push(file_name);
        path
    }

    pub fn pid_file(&self) -> PathBuf {
        self.file_from_datadir("paywall_indexerd.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.file_from_datadir("log")
    }
}

use paywall_indexerd::{
    bitcoind::BitcoinD,
    config::Config,
    db::{maybe_create_db, DbConnection},
    indexer::Indexer,
    indexerd::IndexerD,
    ingest::{self, ZmqSubscriber},
    notify::{log_payments, Notifier},
};

use std::{env, path::PathBuf, process, str::FromStr};

use daemonize_simple::Daemonize;
use tokio::runtime::Builder as RuntimeBuilder;

// No need for complex argument parsing: we only ever accept one, "--conf".
fn parse_args(args: Vec<String>) -> Option<PathBuf> {
    if args.len() == 1 {
        return None;
    }

    if args.len() != 3 || args[1] != "--conf" {
        eprintln!("Unknown arguments '{:?}'.", args);
        eprintln!("Only '--conf <configuration file path>' is supported.");
        process::exit(1);
    }

    Some(PathBuf::from(args[2].to_owned()))
}

// This creates the log file automagically if it doesn't exist, and logs on stdout
// if None is given
fn setup_logger(
    log_file: Option<&str>,
    log_level: log::LevelFilter,
) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level);

    if let Some(log_file) = log_file {
        dispatcher.chain(fern::log_file(log_file)?).apply()?;
    } else {
        dispatcher.chain(std::io::stdout()).apply()?;
    }

    Ok(())
}

async fn tokio_main(indexerd: IndexerD) -> Result<(), Box<dyn std::error::Error>> {
    maybe_create_db(&indexerd.postgres_config).await?;
    let store = DbConnection::new(&indexerd.postgres_config).await?;
    let bitcoind = BitcoinD::new(&indexerd.bitcoind_config)?;

    // Downstream consumers subscribe to the same channel, we just log what we see.
    let notifier = Notifier::new();
    tokio::spawn(log_payments(notifier.subscribe()));

    let mut indexer = Indexer::new(store, bitcoind, notifier)
        .max_reorg_depth(indexerd.max_reorg_depth)
        .retain_blocks(indexerd.retain_blocks);

    // Subscribe first so we don't miss a block found while catching up.
    let mut announcements =
        ZmqSubscriber::connect(&indexerd.zmq_endpoint, &indexerd.zmq_topic).await?;
    indexer.catch_up().await?;
    log::info!("Caught up with the node, waiting for new blocks");

    ingest::run(&mut indexer, &mut announcements).await?;

    Ok(())
}

fn main() {
    #[cfg(not(target_os = "linux"))]
    {
        eprintln!("Only Linux is supported for now.");
        process::exit(1);
    }

    let args = env::args().collect();
    let conf_file = parse_args(args);
    let config = Config::from_file(conf_file).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        process::exit(1);
    });
    let log_level = if let Some(ref level) = &config.log_level {
        log::LevelFilter::from_str(level.as_str()).unwrap_or_else(|e| {
            eprintln!("Invalid log level: {}", e);
            process::exit(1);
        })
    } else {
        log::LevelFilter::Info
    };
    let indexerd = IndexerD::from_config(config).unwrap_or_else(|e| {
        eprintln!("Error creating global state: {}", e);
        process::exit(1);
    });

    let log_file = indexerd.log_file();
    let log_output = if indexerd.daemon {
        Some(log_file.to_str().unwrap_or_else(|| {
            eprintln!("Log file path '{:?}' is not valid unicode", log_file);
            process::exit(1);
        }))
    } else {
        None
    };
    setup_logger(log_output, log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    log::info!(
        "Starting paywall_indexerd, listening for blocks on '{}'",
        indexerd.zmq_endpoint
    );

    if indexerd.daemon {
        let daemon = Daemonize {
            pid_file: Some(indexerd.pid_file()),
            ..Daemonize::default()
        };
        daemon.doit().unwrap_or_else(|e| {
            eprintln!("Error daemonizing: {}", e);
            process::exit(1);
        });
    }

    // Only start the worker threads once we forked.
    let rt = RuntimeBuilder::new_multi_thread()
        .enable_all()
        .thread_name("paywall_indexerd_worker")
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Creating tokio runtime: {}", e);
            process::exit(1);
        });

    rt.block_on(tokio_main(indexerd)).unwrap_or_else(|e| {
        log::error!("Error in event loop: {}", e);
        process::exit(1);
    });
}

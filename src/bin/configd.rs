//! configd - remote configuration service
//!
//! This daemon:
//! 1. Opens the record database
//! 2. Starts one interpreter pool per guest language
//! 3. Serves the config, unit-test, playground and error-report API

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use remote_config::{
    api::ApiServer,
    config::ServiceConfig,
    Dispatcher, MemoryRecordCache, RecordCache, ScriptEngines, SqliteRecordStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON or TOML service config file.
    #[arg(long, env = "CONFIGD_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address, overriding the config file.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ServiceConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let store = Arc::new(
        SqliteRecordStore::open(&config.db_path)
            .with_context(|| format!("opening record store {}", config.db_path))?,
    );
    let records: Arc<dyn RecordCache> = Arc::new(MemoryRecordCache::new());
    let engines = Arc::new(ScriptEngines::new(&config.engine_config())?);
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        Some(records),
        engines,
        config.dispatch_settings(),
    ));
    if config.test_secret.is_none() {
        log::warn!("no test secret configured; unit-test runs will be refused");
    }

    let api_handle = ApiServer::new(config.api_config(), dispatcher).spawn()?;
    log::info!(
        "configd running. serving {} on {}",
        config.db_path,
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("configd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}

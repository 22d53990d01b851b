//! # Runtime
//!
//! Process entry: load configuration, initialize, run until shutdown.
//!
//! - `initialization`: tracing, metrics, server and engine setup
//! - `run_loop`: engine start and signal handling

pub mod initialization;
pub mod run_loop;

use crate::config::SyncConfig;
use anyhow::Result;
use std::path::PathBuf;

/// Load configuration (`SYNC_CONFIG_FILE` when set, otherwise the environment) and run
pub async fn run_from_env() -> Result<()> {
    let config = match std::env::var("SYNC_CONFIG_FILE") {
        Ok(path) => SyncConfig::from_file(&PathBuf::from(path))?,
        Err(_) => SyncConfig::from_env(),
    };
    let init = initialization::initialize(&config).await?;
    run_loop::run(init).await
}

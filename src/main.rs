/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use clap::Parser;
use gatedns::config;
use gatedns::core::app_clock::AppClock;
use gatedns::core::error::Result;
use gatedns::loader::{DataLoader, DirKvStore};
use gatedns::plugin::cache::MemoryResponseCache;
use gatedns::plugin::chain::Chain;
use gatedns::plugin::{PluginEnv, PluginRegistry};
use gatedns::server::HttpServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime;
use tracing::info;

const RESPONSE_CACHE_CAPACITY: usize = 4096;

#[derive(Parser)]
#[clap(version, about = "DNS-over-HTTPS proxy with a plugin pipeline")]
struct Options {
    #[clap(short, long, default_value = "config.yaml")]
    config: PathBuf,
    #[clap(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let options = Options::parse();

    let config = config::load(&options.config)?;
    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }
    let _log_guard = gatedns::core::init_log(log_config);

    let tokio_runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gatedns-worker")
        .build()
        .map_err(|e| gatedns::core::error::DnsError::runtime(e.to_string()))?;

    tokio_runtime.block_on(run(config))
}

async fn run(config: config::types::Config) -> Result<()> {
    info!("gatedns {} starting...", env!("CARGO_PKG_VERSION"));
    AppClock::start();

    let kv_root = config.kv.root.clone().unwrap_or_else(|| "data".to_string());
    let loader_ttl = config.loader.ttl.map(Duration::from_secs);
    let loader = Arc::new(DataLoader::new(Arc::new(DirKvStore::new(kv_root)), loader_ttl));

    let response_cache = Arc::new(MemoryResponseCache::new(RESPONSE_CACHE_CAPACITY));
    response_cache.start_sweeper();

    let env = PluginEnv {
        loader,
        response_cache,
        http_client: reqwest::Client::new(),
    };

    let registry = PluginRegistry::builtin();
    info!("registered plugin kinds: {:?}", registry.kinds());
    let chain = Arc::new(Chain::build(&registry, &env, &config.chain)?);
    info!("plugin chain ready with {} steps", chain.len());

    let server = HttpServer::from_config(&config.server, chain)?;
    server.run().await
}

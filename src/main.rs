//! An edge proxy which serves origin sites under other hostnames, rewriting
//! links and compressing pages with shared dictionaries.

use std::{path::PathBuf, process::exit, sync::Arc, time::Duration};

use anyhow::Context;
pub use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod buffer_pool;
mod compression;
mod dictionaries;
mod errors;
mod origin;
mod pipeline;
mod proxy;
mod rewrite;
mod server;
mod sites;

use crate::buffer_pool::{BufferPool, BUFFER_SIZE, MAX_IDLE_BUFFERS};
use crate::dictionaries::{CacheOptions, DictionaryCache, DirectoryAssets};
use crate::errors::display_causes_and_backtrace;
use crate::origin::{shared_http_client, HttpsOrigin};
use crate::proxy::{Proxy, ProxyOptions};
use crate::server::run_server;
use crate::sites::SiteTable;

/// Idle origin connections to keep per host.
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 32;

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(
    about = "Proxy sites under new hostnames, with dictionary compression",
    version
)]
struct Opt {
    /// Address to listen on.
    #[arg(long = "listen", default_value = "0.0.0.0:8787")]
    listen_addr: String,

    /// A JSON file mapping public hostnames to origins and dictionaries.
    #[arg(long = "sites")]
    sites_path: PathBuf,

    /// Directory containing one file per dictionary id.
    #[arg(long = "dictionary-dir", default_value = "dictionaries")]
    dictionary_dir: PathBuf,

    /// URL path prefix where dictionaries are served.
    #[arg(long = "dictionary-path", default_value = proxy::DEFAULT_DICTIONARY_PATH)]
    dictionary_path: String,

    /// Seconds a prepared dictionary may sit unused before we evict it.
    #[arg(long = "dictionary-ttl", default_value_t = 3600)]
    dictionary_ttl: u64,

    /// `Cache-Control` max-age for dictionary downloads, in seconds.
    #[arg(long = "dictionary-max-age", default_value_t = 2_592_000)]
    dictionary_max_age: u64,

    /// Seconds between sweeps for idle dictionaries.
    #[arg(
        long = "sweep-interval",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    sweep_interval: u64,

    /// zstd compression level for dictionary compression.
    #[arg(long = "compression-level", default_value_t = dictionaries::DEFAULT_COMPRESSION_LEVEL)]
    compression_level: i32,
}

fn main() {
    // Set up tracing. `RUST_LOG` overrides our default filter.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,dictionary_proxy=info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(err) = run() {
        display_causes_and_backtrace(&err);
        exit(1);
    }
}

/// Our main entry point.
fn run() -> Result<()> {
    // Parse our command-line arguments.
    let opt = Opt::parse();

    // Keep metrics in memory, and log them when we exit.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("could not install metrics recorder")?;
    compression::describe_metrics();
    pipeline::describe_metrics();

    let sites = SiteTable::from_path(&opt.sites_path)?;
    if sites.is_empty() {
        warn!("no sites configured in {}", opt.sites_path.display());
    }
    info!("loaded {} sites", sites.len());

    let runtime = tokio::runtime::Runtime::new().context("unable to create a runtime")?;
    let result = runtime.block_on(async {
        let cache = DictionaryCache::new(
            Arc::new(DirectoryAssets::new(opt.dictionary_dir.clone())),
            CacheOptions {
                ttl: Duration::from_secs(opt.dictionary_ttl),
                sweep_interval: Duration::from_secs(opt.sweep_interval),
                compression_level: opt.compression_level,
            },
        );
        let origin = Arc::new(HttpsOrigin::new(shared_http_client(
            MAX_IDLE_CONNECTIONS_PER_HOST,
        )));
        let proxy = Arc::new(Proxy::new(
            sites,
            origin,
            cache,
            BufferPool::new(BUFFER_SIZE, MAX_IDLE_BUFFERS),
            ProxyOptions {
                dictionary_path: opt.dictionary_path.clone(),
                dictionary_max_age: Duration::from_secs(opt.dictionary_max_age),
            },
        )?);

        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for shutdown signal: {}", err);
                futures::future::pending::<()>().await;
            }
            info!("shutting down");
        };
        run_server(
            &opt.listen_addr,
            proxy,
            Duration::from_secs(opt.sweep_interval),
            shutdown,
        )
        .await
    });

    info!("Metrics:\n{}", metrics_handle.render());
    result
}

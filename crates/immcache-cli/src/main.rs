//! Fetches an HTTP resource through an immutable disk cache.
//!
//! The resource is fetched twice: the first fetch populates the cache, the second one is served
//! from disk. Both reads must be byte-identical. The content is then written to stdout and the
//! cache is purged, unless `--keep` is passed.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use immcache::{DiskCache, Loader, StreamSource};
use reqwest::Url;
use tokio::io::AsyncReadExt;
use tracing::level_filters::LevelFilter;

use crate::config::Config;
use crate::http::HttpLoader;

mod config;
mod http;
mod logging;

/// The resource fetched when no URL is given.
const DEFAULT_URL: &str = "https://raw.githubusercontent.com/getsentry/symbolicator/master/README.md";

/// Fetches a resource through a disk cache and prints it.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The URL of the resource to fetch.
    #[arg(default_value = DEFAULT_URL)]
    url: Url,

    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The severity level of logging output.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long)]
    log_level: Option<LevelFilter>,

    /// The disk budget of the cache in bytes. `0` disables eviction.
    #[arg(long, value_name = "BYTES")]
    max_size: Option<u64>,

    /// Keep the cache directory instead of purging it at exit.
    #[arg(long)]
    keep: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(max_size) = cli.max_size {
        config.cache.max_size = max_size;
    }

    logging::init_logging(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build the HTTP client")?;
    let loader = HttpLoader::new(client);

    let content = runtime.block_on(async {
        let cache = DiskCache::new(config.cache);
        let result = fetch_twice(&cache, &loader, cli.url.as_str()).await;

        match cache.base_path() {
            Some(path) if cli.keep => {
                tracing::info!(path = %path.display(), "Keeping cache directory");
            }
            _ => {
                if let Err(err) = cache.purge_and_close().await {
                    let dynerr: &dyn std::error::Error = &err;
                    tracing::warn!(error = dynerr, "Could not purge cache");
                }
            }
        }

        result
    })?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&content)?;
    stdout.flush()?;

    Ok(())
}

/// Fetches `key` twice through `cache` and checks that both reads agree.
///
/// The first fetch populates the cache, the second one is expected to be served from it.
async fn fetch_twice<L>(cache: &DiskCache, loader: &L, key: &str) -> Result<Vec<u8>>
where
    L: Loader + ?Sized,
{
    let (first, source) = fetch(cache, loader, key).await?;
    tracing::debug!(?source, size = first.len(), "First fetch done");

    let (second, source) = fetch(cache, loader, key).await?;
    tracing::debug!(?source, size = second.len(), "Second fetch done");
    if source != StreamSource::Disk {
        tracing::info!(key, "Resource was not cached");
    }

    if first != second {
        bail!("cached content differs from the loaded content");
    }
    Ok(first)
}

async fn fetch<L>(cache: &DiskCache, loader: &L, key: &str) -> Result<(Vec<u8>, StreamSource)>
where
    L: Loader + ?Sized,
{
    let mut stream = cache.get_or_load(key, loader).await?;
    let source = stream.source();

    let mut content = Vec::new();
    let read = stream.read_to_end(&mut content).await;
    // close even after a failed read so the load is released
    let closed = stream.close().await;

    read.context("failed to read resource")?;
    closed.context("failed to close resource")?;
    Ok((content, source))
}

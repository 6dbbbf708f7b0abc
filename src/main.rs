//! pagecache - read documents from a remote content API through a local cache
//!
//! Wires the rate limiter, retry executor and cache together behind a small
//! command line. Results are printed to stdout as JSON; logs go to stderr.

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use pagecache::api::{HttpContentApi, RateLimitedClient};
use pagecache::cache::Cache;
use pagecache::cli::{build_query, Cli, Command};
use pagecache::config::{token_from_env, ClientConfig};
use pagecache::fetcher::CachedFetcher;

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `warn` default
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = ClientConfig::from_env()?;
    cli.apply(&mut config)?;
    config.validate()?;
    debug!(?config, "Resolved configuration");

    let ctx = cli.context();
    let on_interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let cache = Arc::new(Cache::open(&config.cache_dir).await?);

    match &cli.command {
        Command::Document { id } => {
            let fetcher = connect(&config, cache)?;
            print_json(&fetcher.document(&ctx, id).await?)?;
        }
        Command::Children { id } => {
            let fetcher = connect(&config, cache)?;
            print_json(&fetcher.children(&ctx, id).await?)?;
        }
        Command::Query { id, filter, sorts } => {
            // Flag errors are reported before the token is required.
            let query = build_query(filter.as_deref(), sorts)?;
            let fetcher = connect(&config, cache)?;
            print_json(&fetcher.collection(&ctx, id, &query).await?)?;
        }
        Command::Stats => {
            let stats = cache.stats();
            print_json(&json!({
                "dir": cache.dir().display().to_string(),
                "size": stats.size,
                "hits": stats.hits,
                "misses": stats.misses,
                "hit_rate": stats.hit_rate(),
            }))?;
        }
        Command::Prune => {
            let removed = cache.prune_expired(&ctx).await?;
            print_json(&json!({ "removed": removed }))?;
        }
        Command::Clear => {
            cache.clear().await?;
            print_json(&json!({ "cleared": true }))?;
        }
    }
    Ok(())
}

/// Builds the cache-through fetcher over the HTTP provider
fn connect(
    config: &ClientConfig,
    cache: Arc<Cache>,
) -> Result<CachedFetcher<HttpContentApi>, Box<dyn Error>> {
    let token = token_from_env()?;
    let api = Arc::new(HttpContentApi::new(
        &config.api_base_url,
        token,
        config.request_timeout,
    )?);
    let client = RateLimitedClient::new(api, config.rate_limiter()?);
    Ok(CachedFetcher::new(
        cache,
        client,
        config.retry_operation(),
        config.default_ttl,
    ))
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pagecache: {err}");
            ExitCode::FAILURE
        }
    }
}

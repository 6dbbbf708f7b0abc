//! Command-line interface parsing for pagecache
//!
//! Global flags override the environment configuration; subcommands pick the
//! read to perform or the cache maintenance task to run.

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use serde_json::Value;
use thiserror::Error;

use crate::api::CollectionQuery;
use crate::config::ClientConfig;
use crate::context::Context;

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// A JSON-valued flag did not parse
    #[error("invalid JSON for --{flag}: {source}")]
    InvalidJson {
        flag: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The TTL does not fit in a duration
    #[error("invalid --ttl: {0} seconds is out of range")]
    InvalidTtl(i64),
}

/// pagecache - rate-limited, cached reads from a remote content API
#[derive(Parser, Debug)]
#[command(name = "pagecache")]
#[command(about = "Rate-limited, cached reads from a remote content API")]
#[command(version)]
pub struct Cli {
    /// Directory holding cache entries
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Freshness of stored results in seconds (0 keeps them forever)
    #[arg(long, global = true, value_name = "SECONDS")]
    pub ttl: Option<i64>,

    /// Sustained remote calls per second
    #[arg(long, global = true)]
    pub rate: Option<f64>,

    /// Remote calls allowed in a burst
    #[arg(long, global = true)]
    pub burst: Option<u32>,

    /// Retries after the first failed attempt
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Give up on the whole command after this many seconds
    #[arg(long, global = true, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Read a document
    Document {
        id: String,
    },
    /// List every child of a node
    Children {
        id: String,
    },
    /// Query a collection
    Query {
        id: String,
        /// Filter object as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
        /// Sort clause as JSON; repeat for several
        #[arg(long = "sort", value_name = "JSON")]
        sorts: Vec<String>,
    },
    /// Show cache statistics
    Stats,
    /// Delete expired cache entries
    Prune,
    /// Delete every cache entry
    Clear,
}

impl Cli {
    /// Overrides `config` with any flags given on the command line
    pub fn apply(&self, config: &mut ClientConfig) -> Result<(), CliError> {
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(secs) = self.ttl {
            config.default_ttl = TimeDelta::try_seconds(secs).ok_or(CliError::InvalidTtl(secs))?;
        }
        if let Some(rate) = self.rate {
            config.rate_per_second = rate;
        }
        if let Some(burst) = self.burst {
            config.burst = burst;
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        Ok(())
    }

    /// Context for the whole command, bounded by `--timeout` when given
    pub fn context(&self) -> Context {
        match self.timeout {
            Some(secs) => Context::with_timeout(Duration::from_secs(secs)),
            None => Context::new(),
        }
    }
}

/// Builds a collection query from the `--filter` and `--sort` flags
pub fn build_query(filter: Option<&str>, sorts: &[String]) -> Result<CollectionQuery, CliError> {
    let filter = filter.map(|raw| parse_json_arg("filter", raw)).transpose()?;
    let sorts = sorts
        .iter()
        .map(|raw| parse_json_arg("sort", raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CollectionQuery {
        filter,
        sorts,
        ..CollectionQuery::default()
    })
}

/// Parses one JSON-valued flag
pub fn parse_json_arg(flag: &'static str, raw: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw).map_err(|source| CliError::InvalidJson { flag, source })
}

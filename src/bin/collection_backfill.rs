//! collection-backfill: one-shot import of an account's collections and
//! tokens from the node's `0x3::token` event streams.
//!
//! ```text
//! collection-backfill --account <addr> [--collection <name>] [--node <url>]
//! ```
//!
//! Needs `DATABASE_URL`; `HTTP_TIMEOUT_SECS` bounds each node request
//! (default 30). Per-item failures are written to
//! `collection_backfill.log` and never fail the run.

use std::fs::OpenOptions;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use aptos_event_indexer::backfill::{self, Dumper, Fetcher};
use aptos_event_indexer::source::EventSource;
use aptos_event_indexer::store::PgStore;

const LOG_FILE: &str = "collection_backfill.log";
const DEFAULT_NODE_URL: &str = "https://fullnode.devnet.aptoslabs.com/v1";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
struct Args {
    account: String,
    collection: Option<String>,
    node: String,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut account = None;
    let mut collection = None;
    let mut node = DEFAULT_NODE_URL.to_string();

    while let Some(flag) = args.next() {
        let mut value = || args.next().with_context(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "-a" | "--account" => account = Some(value()?),
            "-c" | "--collection" => collection = Some(value()?),
            "--node" => node = value()?,
            other => bail!("unknown argument {other}"),
        }
    }

    Ok(Args {
        account: account.context("--account is required")?,
        collection,
        node: node.trim_end_matches('/').to_string(),
    })
}

fn http_timeout(raw: Option<String>) -> Duration {
    let secs = raw
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
    Duration::from_secs(secs.max(1))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .with_context(|| format!("failed to open {LOG_FILE}"))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        ))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file))
                .with_filter(LevelFilter::ERROR),
        )
        .init();

    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let pool = PgPoolOptions::new()
        .max_connections(backfill::WRITE_CONCURRENCY as u32)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;
    let store = PgStore::new(pool, Duration::from_secs(60));

    let timeout = http_timeout(std::env::var("HTTP_TIMEOUT_SECS").ok());
    let client = reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;
    let fetcher = Fetcher::new(EventSource::new(client, args.node.clone()), &args.account);
    let dumper = Dumper::new(store);

    tracing::info!(
        account = %args.account,
        collection = ?args.collection,
        node = %args.node,
        "starting collection backfill"
    );
    let report = backfill::run(&fetcher, &dumper, args.collection.as_deref()).await;
    tracing::info!(?report, "collection backfill finished");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| (*s).to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn account_is_required() {
        assert!(parse_args(args(&["--collection", "Apes"])).is_err());
    }

    #[test]
    fn flags_are_parsed() {
        let Ok(parsed) = parse_args(args(&["-a", "0xabc", "--node", "http://localhost:8080/v1/"]))
        else {
            panic!("valid arguments");
        };
        assert_eq!(parsed.account, "0xabc");
        assert_eq!(parsed.collection, None);
        assert_eq!(parsed.node, "http://localhost:8080/v1");
    }

    #[test]
    fn http_timeout_defaults_and_floors() {
        assert_eq!(http_timeout(None), Duration::from_secs(30));
        assert_eq!(http_timeout(Some("5".to_string())), Duration::from_secs(5));
        assert_eq!(http_timeout(Some("0".to_string())), Duration::from_secs(1));
        assert_eq!(http_timeout(Some("soon".to_string())), Duration::from_secs(30));
    }

    #[test]
    fn dangling_flag_is_rejected() {
        assert!(parse_args(args(&["--account"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
    }
}

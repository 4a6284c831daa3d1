//! Indexer configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Only `DATABASE_URL` has no useful
//! default outside local development.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::EventKind;
use crate::error::ConfigError;
use crate::source::StreamLocator;

const DEFAULT_NODE_URL: &str = "https://fullnode.devnet.aptoslabs.com/v1";
const DEFAULT_COLLECTION_NAME: &str = "Imart Default Collection";
const DEFAULT_COLLECTION_CREATOR: &str =
    "0x94961b26c3541d4be6638913335da22cf3c45aa3d44ff110d9df8890c0c1a34b";
const DEFAULT_RESOURCE_ACCOUNT: &str =
    "0xe59d3179e6d4598937a33beb71f811b9bad18af1c253014d6b4945e44f710590";

/// The collection every creation-module token is minted into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultCollection {
    /// Collection name.
    pub name: String,
    /// Collection creator, used to look the collection up.
    pub creator: String,
    /// Resource account recorded as the token creator.
    pub resource_account: String,
}

impl Default for DefaultCollection {
    fn default() -> Self {
        Self {
            name: DEFAULT_COLLECTION_NAME.to_string(),
            creator: DEFAULT_COLLECTION_CREATOR.to_string(),
            resource_account: DEFAULT_RESOURCE_ACCOUNT.to_string(),
        }
    }
}

/// Polling and retry cadence of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between polls once a stream is caught up.
    pub idle_interval: Duration,
    /// First retry delay after a transient failure.
    pub retry_base: Duration,
    /// Upper bound for the exponential retry delay.
    pub retry_max: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(1_000),
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_millis(30_000),
        }
    }
}

/// Top-level indexer configuration.
///
/// Loaded once at startup via [`IndexerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Base URL of the ledger node REST API (e.g. `https://.../v1`).
    pub node_url: String,

    /// PostgreSQL connection string.
    pub database_url: String,

    /// Maximum number of database connections in the pool.
    pub database_max_connections: u32,

    /// Minimum idle connections in the pool.
    pub database_min_connections: u32,

    /// Timeout in seconds for acquiring a database connection.
    pub database_connect_timeout_secs: u64,

    /// Whether to run embedded migrations at startup.
    pub run_migrations: bool,

    /// Redis URL for cache invalidation; `None` disables invalidation.
    pub redis_url: Option<String>,

    /// Prefix of every invalidated cache key.
    pub cache_key_prefix: String,

    /// Budget for the post-commit cache deletes of one event.
    pub cache_timeout: Duration,

    /// Per-request timeout of the ledger node HTTP client.
    pub http_timeout: Duration,

    /// Events requested per page.
    pub page_limit: u32,

    /// Deadline of a single per-event transaction.
    pub tx_timeout: Duration,

    /// Poll and retry cadence.
    pub poll: PollPolicy,

    /// Address of the curation module (root of galleries and offers).
    pub curation_address: String,

    /// Token collection used by the creation module.
    pub default_collection: DefaultCollection,

    /// Event stream location of every enabled stream.
    pub streams: BTreeMap<EventKind, StreamLocator>,
}

impl IndexerConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set. Calls
    /// `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `NODE_URL` is not an HTTP URL, when
    /// `DATABASE_URL` or a module address needed by an enabled stream is
    /// missing, or when `ENABLED_STREAMS` names an unknown stream.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same conditions as [`IndexerConfig::from_env`].
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let node_url = get("NODE_URL")
            .unwrap_or_else(|| DEFAULT_NODE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(node_url.starts_with("http://") || node_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "NODE_URL",
                value: node_url,
            });
        }

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let enabled = match get("ENABLED_STREAMS") {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.parse::<EventKind>().map_err(ConfigError::UnknownStream))
                .collect::<Result<Vec<_>, _>>()?,
            _ => EventKind::ALL.to_vec(),
        };

        let mut streams = BTreeMap::new();
        for kind in enabled {
            streams.insert(kind, stream_locator(&get, kind)?);
        }

        let curation_address = get("CURATION_ADDRESS").unwrap_or_default();
        let needs_curation = streams.keys().any(|k| {
            matches!(
                k,
                EventKind::GalleryCreate
                    | EventKind::CurationOfferCreate
                    | EventKind::CurationOfferReject
            )
        });
        if needs_curation && curation_address.is_empty() {
            return Err(ConfigError::Missing("CURATION_ADDRESS"));
        }

        let default_collection = DefaultCollection {
            name: get("DEFAULT_COLLECTION_NAME")
                .unwrap_or_else(|| DEFAULT_COLLECTION_NAME.to_string()),
            creator: get("DEFAULT_COLLECTION_CREATOR")
                .unwrap_or_else(|| DEFAULT_COLLECTION_CREATOR.to_string()),
            resource_account: get("DEFAULT_RESOURCE_ACCOUNT")
                .unwrap_or_else(|| DEFAULT_RESOURCE_ACCOUNT.to_string()),
        };

        let defaults = PollPolicy::default();
        let poll = PollPolicy {
            idle_interval: Duration::from_millis(parse_var(
                &get,
                "POLL_INTERVAL_MS",
                millis(defaults.idle_interval),
            )),
            retry_base: Duration::from_millis(parse_var(
                &get,
                "RETRY_BASE_MS",
                millis(defaults.retry_base),
            )),
            retry_max: Duration::from_millis(parse_var(
                &get,
                "RETRY_MAX_MS",
                millis(defaults.retry_max),
            )),
        };

        Ok(Self {
            node_url,
            database_url,
            database_max_connections: parse_var(&get, "DATABASE_MAX_CONNECTIONS", 10),
            database_min_connections: parse_var(&get, "DATABASE_MIN_CONNECTIONS", 2),
            database_connect_timeout_secs: parse_var(&get, "DATABASE_CONNECT_TIMEOUT_SECS", 5),
            run_migrations: parse_var_bool(&get, "RUN_MIGRATIONS", true),
            redis_url: get("REDIS_URL").filter(|s| !s.is_empty()),
            cache_key_prefix: get("CACHE_KEY_PREFIX").unwrap_or_else(|| "cache:imart".to_string()),
            cache_timeout: Duration::from_millis(parse_var(&get, "CACHE_TIMEOUT_MS", 2_000)),
            http_timeout: Duration::from_secs(
                parse_var::<u64>(&get, "HTTP_TIMEOUT_SECS", 30).max(1),
            ),
            page_limit: parse_var::<u32>(&get, "EVENT_PAGE_LIMIT", 100).max(1),
            tx_timeout: Duration::from_secs(parse_var(&get, "TX_TIMEOUT_SECS", 60)),
            poll,
            curation_address,
            default_collection,
            streams,
        })
    }
}

/// Resolves the handle and field of one stream.
///
/// `<KIND>_EVENT_HANDLE` wins; otherwise the handle is built from the
/// owning module's address variable and the kind's default struct.
fn stream_locator(
    get: &impl Fn(&str) -> Option<String>,
    kind: EventKind,
) -> Result<StreamLocator, ConfigError> {
    let prefix = kind.env_prefix();
    let field = get(&format!("{prefix}_EVENT_FIELD"))
        .unwrap_or_else(|| kind.default_field().to_string());

    if let Some(handle) = get(&format!("{prefix}_EVENT_HANDLE")) {
        return Ok(StreamLocator::from_handle(handle, field));
    }

    let address_key = module_address_key(kind);
    let address = get(address_key)
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::Missing(address_key))?;
    Ok(StreamLocator::from_handle(
        format!("{address}::{}", kind.handle_suffix()),
        field,
    ))
}

/// Returns the environment variable holding the address of `kind`'s module.
const fn module_address_key(kind: EventKind) -> &'static str {
    match kind {
        EventKind::CreateToken => "CREATION_ADDRESS",
        EventKind::List | EventKind::Delist => "MARKETPLACE_ADDRESS",
        EventKind::GalleryCreate
        | EventKind::CurationOfferCreate
        | EventKind::CurationOfferReject => "CURATION_ADDRESS",
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Parses a variable as `T`, returning `default` on missing or invalid values.
fn parse_var<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parses a variable as a boolean. Accepts `"true"`, `"1"`, `"false"`,
/// `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_var_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}

//! Sync configuration loaded from environment variables.
//!
//! Every setting has a default so an embedding application can start with
//! zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_CHANGE_CAPACITY, DEFAULT_FETCH_PAGE_SIZE, DEFAULT_LIVE_BACKOFF_INITIAL_MS,
    DEFAULT_LIVE_BACKOFF_MAX_MS, DEFAULT_LOOKUP_BATCH_SIZE, DEFAULT_LOOKUP_CONCURRENCY,
    DEFAULT_PAGE_SIZE,
};
use parley_store::Database;

use crate::error::Result;
use crate::store::LocalStore;

/// Tunables for the sync engine and contact reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// SQLite database file.
    /// Env: `PARLEY_DB_PATH`
    /// Default: `parley.db` in the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Messages replayed to a conversation observer.
    /// Env: `PARLEY_PAGE_SIZE`
    pub page_size: u32,

    /// Messages requested per catch-up fetch.
    /// Env: `PARLEY_FETCH_PAGE_SIZE`
    pub fetch_page_size: u32,

    /// First delay before reconnecting a dropped live subscription.
    /// Env: `PARLEY_LIVE_BACKOFF_INITIAL_MS`
    pub live_backoff_initial: Duration,

    /// Upper bound for the doubling reconnect delay.
    /// Env: `PARLEY_LIVE_BACKOFF_MAX_MS`
    pub live_backoff_max: Duration,

    /// Phone numbers per registration lookup call.
    /// Env: `PARLEY_LOOKUP_BATCH_SIZE`
    pub lookup_batch_size: usize,

    /// Lookup calls in flight at once.
    /// Env: `PARLEY_LOOKUP_CONCURRENCY`
    pub lookup_concurrency: usize,

    /// Country calling code applied to numbers without an international
    /// prefix, digits only (e.g. `"44"`).
    /// Env: `PARLEY_DEFAULT_COUNTRY_CODE`
    pub default_country_code: Option<String>,

    /// Buffered store change notifications before slow observers lag.
    /// Env: `PARLEY_CHANGE_CAPACITY`
    pub change_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            page_size: DEFAULT_PAGE_SIZE,
            fetch_page_size: DEFAULT_FETCH_PAGE_SIZE,
            live_backoff_initial: Duration::from_millis(DEFAULT_LIVE_BACKOFF_INITIAL_MS),
            live_backoff_max: Duration::from_millis(DEFAULT_LIVE_BACKOFF_MAX_MS),
            lookup_batch_size: DEFAULT_LOOKUP_BATCH_SIZE,
            lookup_concurrency: DEFAULT_LOOKUP_CONCURRENCY,
            default_country_code: None,
            change_capacity: DEFAULT_CHANGE_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var("PARLEY_DB_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(n) = parse_positive::<u32>(&var, "PARLEY_PAGE_SIZE") {
            config.page_size = n;
        }
        if let Some(n) = parse_positive::<u32>(&var, "PARLEY_FETCH_PAGE_SIZE") {
            config.fetch_page_size = n;
        }
        if let Some(ms) = parse_positive::<u64>(&var, "PARLEY_LIVE_BACKOFF_INITIAL_MS") {
            config.live_backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_positive::<u64>(&var, "PARLEY_LIVE_BACKOFF_MAX_MS") {
            config.live_backoff_max = Duration::from_millis(ms);
        }
        if let Some(n) = parse_positive::<usize>(&var, "PARLEY_LOOKUP_BATCH_SIZE") {
            config.lookup_batch_size = n;
        }
        if let Some(n) = parse_positive::<usize>(&var, "PARLEY_LOOKUP_CONCURRENCY") {
            config.lookup_concurrency = n;
        }
        if let Some(n) = parse_positive::<usize>(&var, "PARLEY_CHANGE_CAPACITY") {
            config.change_capacity = n;
        }

        if let Some(code) = var("PARLEY_DEFAULT_COUNTRY_CODE") {
            let digits: String = code.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                tracing::warn!(value = %code, "Invalid PARLEY_DEFAULT_COUNTRY_CODE, ignoring");
            } else {
                config.default_country_code = Some(digits);
            }
        }

        if config.live_backoff_max < config.live_backoff_initial {
            tracing::warn!(
                initial_ms = config.live_backoff_initial.as_millis() as u64,
                max_ms = config.live_backoff_max.as_millis() as u64,
                "Live backoff maximum below initial delay, raising it"
            );
            config.live_backoff_max = config.live_backoff_initial;
        }

        config
    }

    /// Open the configured database and wrap it for shared async access.
    pub fn open_store(&self) -> Result<LocalStore> {
        let db = match &self.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Ok(LocalStore::new(db, self.change_capacity))
    }
}

/// Parse a strictly positive number, warning and returning `None` otherwise.
fn parse_positive<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) if n > T::default() => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

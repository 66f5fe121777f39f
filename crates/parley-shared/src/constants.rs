/// Application name
pub const APP_NAME: &str = "Parley";

/// Default number of messages replayed to a conversation observer
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Default number of messages requested per catch-up fetch
pub const DEFAULT_FETCH_PAGE_SIZE: u32 = 200;

/// Live subscription reconnect backoff bounds (milliseconds)
pub const DEFAULT_LIVE_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_LIVE_BACKOFF_MAX_MS: u64 = 30_000;

/// Registration lookup chunking
pub const DEFAULT_LOOKUP_BATCH_SIZE: usize = 100;
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 4;

/// Capacity of the store change broadcast channel
pub const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Participant setting key holding a user-chosen conversation title
pub const SETTING_DISPLAY_NAME: &str = "display_name";

/// Database file name inside the platform data directory
pub const DATABASE_FILE_NAME: &str = "parley.db";

//! Application-wide constants
//!
//! Centralized location for defaults and magic strings
//! that are used across multiple modules.

/// Default message-store REST endpoint
pub const API_BASE_URL: &str = "https://api.squadlink.gg/v1";

/// Default push-channel endpoint
pub const PUSH_URL: &str = "wss://push.squadlink.gg/socket";

/// Default data directory name (relative to the working directory)
pub const DEFAULT_DATA_DIR: &str = "squadlink_data";

/// File name of the persisted last-seen checkpoints inside the data directory
pub const LAST_SEEN_FILE: &str = "last_seen.json";

/// How far apart an optimistic send and its server echo may be and still be
/// paired by the content heuristic (used only when the echo lacks a client id).
pub const ECHO_MATCH_WINDOW_MS: u64 = 10_000;

/// Prefix of client-generated temporary message ids
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Maximum characters kept in a conversation's last-message preview
pub const PREVIEW_MAX_CHARS: usize = 80;

/// Maximum characters kept in a reply snapshot
pub const REPLY_SNAPSHOT_MAX_CHARS: usize = 120;

// Reconnect defaults
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 500;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

/// Timeout applied to every message-store request
pub const REQUEST_TIMEOUT_MS: u64 = 15_000;

// Push topic prefixes
pub mod topics {
    /// Private chat with one counterpart
    pub const DIRECT: &str = "dm";
    /// Team channel
    pub const TEAM: &str = "team";
    /// Session-wide inbox of the local user (unread + presence fan-in)
    pub const USER: &str = "user";
}

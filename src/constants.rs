//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Admiteron.
//!
//! Every default used by the admission pipeline lives here so that the
//! configuration layer and the components agree on the same numbers.

// ============================================================================
// Rate Limit Constants
// ============================================================================

/// Default maximum requests per client within one window.
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 100;

/// Default rate limit window (60 seconds).
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Interval between compaction passes of the in-memory sliding window (30 seconds).
///
/// Timestamps older than the largest configured window are dropped.
pub const DEFAULT_WINDOW_COMPACTION_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Auto-Block Constants
// ============================================================================

/// Number of high/critical events within the lookback window that trips an auto block.
pub const DEFAULT_AUTO_BLOCK_VIOLATION_THRESHOLD: u32 = 5;

/// Lookback window for violation tallies (1 hour).
pub const DEFAULT_AUTO_BLOCK_LOOKBACK_SECS: u64 = 3600;

/// Duration of an auto block (24 hours).
pub const DEFAULT_AUTO_BLOCK_DURATION_SECS: u64 = 86400;

/// Upper bound for any configured window, lookback or block duration (10 years).
pub const MAX_CONFIGURED_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// `blocked_by` value written for blocks created by the system itself.
pub const AUTO_BLOCKED_BY: &str = "auto";

// ============================================================================
// Logging Constants
// ============================================================================

/// Maximum length (in characters) of sanitized request data stored on a security event.
pub const DEFAULT_MAX_REQUEST_DATA_LEN: usize = 1000;

/// Maximum length (in characters) of a captured user agent.
pub const DEFAULT_MAX_USER_AGENT_LEN: usize = 500;

/// Upper bound for a single store call (2 seconds).
///
/// Applies to every log write and every rate-limit or blacklist consult.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Default number of records kept per kind by the memory store.
pub const DEFAULT_MEMORY_RETENTION_PER_KIND: usize = 100_000;

/// Tracing target used as the fallback diagnostic channel when a log write fails.
pub const FALLBACK_TARGET: &str = "admiteron::fallback";

// ============================================================================
// Query Constants
// ============================================================================

/// Default record limit of an operator log query.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Hard cap on the record limit of an operator log query.
pub const MAX_QUERY_LIMIT: usize = 1000;

// ============================================================================
// Validation Constants
// ============================================================================

/// Maximum textual length of an IP address (IPv6 with zone stripped).
pub const MAX_IP_ADDRESS_LENGTH: usize = 45;

/// Maximum length of a resolved client key.
///
/// Matches the `client_ip` / `ip_address` columns of the persistent store.
pub const MAX_CLIENT_KEY_LENGTH: usize = 64;

/// Maximum length of a blacklist reason.
pub const MAX_BLOCK_REASON_LENGTH: usize = 500;

/// Maximum length of an operator identifier.
pub const MAX_OPERATOR_LENGTH: usize = 100;

// ============================================================================
// Identity Constants
// ============================================================================

/// Default proxy forwarding header (lowercase).
pub const DEFAULT_FORWARDED_HEADER: &str = "x-forwarded-for";

/// Prefix of the shared rate-limit key used for clients without a resolvable IP.
pub const UNKNOWN_CLIENT_PREFIX: &str = "unknown";

// ============================================================================
// Response Constants
// ============================================================================

/// Status returned for rate limited requests.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Status returned for blacklisted clients.
pub const STATUS_FORBIDDEN: u16 = 403;

/// Status recorded for requests whose handler failed.
pub const STATUS_INTERNAL_ERROR: u16 = 500;

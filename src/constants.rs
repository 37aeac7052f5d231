/// Status codes that make a provider failure eligible for fallback.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// Substrings of generic failure messages that are treated as transient.
pub const RETRYABLE_MESSAGE_MARKERS: &[&str] = &[
    "429",
    "500",
    "502",
    "503",
    "504",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
];

/// Phrases in backend text output that indicate the worker has been rate limited.
pub const RATE_LIMIT_PHRASES: &[&str] = &[
    "you've hit your limit",
    "hit your limit",
    "rate limit",
    "usage limit",
    "quota exceeded",
    "too many requests",
    "capacity",
    "try again later",
];

/// Failure signatures that mean "this worker cannot serve now". Only consulted
/// before the first chunk reaches the caller.
///
/// "exit code 1" is a coarse heuristic: the CLI reports most failures that way,
/// including non-transient ones such as malformed prompts.
pub const WORKER_UNAVAILABLE_SIGNATURES: &[&str] = &[
    "credit balance",
    "balance is too low",
    "rate limit",
    "usage limit",
    "authentication failed",
    "unauthorized",
    "invalid token",
    "oauth token",
    "token expired",
    "401",
    "invalid api key",
    "overloaded",
    "500",
    "502",
    "503",
    "504",
    "exit code 1",
];

pub const WORKER_FAILOVER_HEADER: &str = "x-worker-failover";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub const PROMPT_PREVIEW_CHARS: usize = 200;
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 10 * 1024 * 1024;
pub const CACHE_FILE_PREFIX: &str = "switchyard_recovery_";
pub const SUMMARY_FILE_PREFIX: &str = "final_";

/// Floor for advertised retry-after values.
pub const MIN_RETRY_AFTER_SECS: u64 = 60;
/// Backoff assumed when a rate-limit notice carries no parseable reset time.
pub const DEFAULT_RATE_LIMIT_BACKOFF_SECS: i64 = 3600;

/// Suggested corrective actions attached to diagnostic chunks.
pub const ACTION_INCREASE_TIMEOUT: &str = "INCREASE_TIMEOUT_OR_REDUCE_PROMPT";
pub const ACTION_VERIFY_COMPLETENESS: &str = "VERIFY_RESPONSE_COMPLETENESS";
pub const ACTION_RETRY_FULL_REQUEST: &str = "RETRY_FULL_REQUEST";

/// Max stderr kept from a failed CLI process for error messages.
pub const STDERR_TAIL_CHARS: usize = 2000;
/// Max length of one line read from a backend stream.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

pub const LOG_FILE_PREFIX: &str = "switchyard.log";

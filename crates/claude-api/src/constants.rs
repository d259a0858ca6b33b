//! Anthropic Messages API constants
//!
//! Paths and header names are fixed by the upstream API. The API version is
//! configurable in the service; [`DEFAULT_API_VERSION`] is used when the config
//! file leaves it out.

/// Message-generation path appended to the configured base URL
pub const MESSAGES_PATH: &str = "/v1/messages";

/// Header carrying the dispatched credential
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the API version
pub const VERSION_HEADER: &str = "anthropic-version";

/// Anthropic API version header value
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Upstream hint that the request may be retried
pub const SHOULD_RETRY_HEADER: &str = "x-should-retry";

/// Present on throttled responses; its value is not interpreted
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// RFC 3339 timestamp at which the request rate limit resets
pub const REQUESTS_RESET_HEADER: &str = "anthropic-ratelimit-requests-reset";

/// Fixed sampling temperature for every call
pub const TEMPERATURE: f64 = 1.0;

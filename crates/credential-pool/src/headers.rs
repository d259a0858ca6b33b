//! Credential state derived from upstream response headers
//!
//! A key is judged throttled only when the API both says the request may be
//! retried (`x-should-retry: true`) and sends `retry-after`. Either header on
//! its own can accompany failures unrelated to the key's rate limit, so one
//! signal alone leaves the key `Valid`.

use chrono::{DateTime, Utc};
use claude_api::{REQUESTS_RESET_HEADER, RETRY_AFTER_HEADER, SHOULD_RETRY_HEADER};
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::pool::CredentialState;

/// Derive the state a credential is in after a response carrying `headers`.
///
/// The retry deadline comes from `anthropic-ratelimit-requests-reset`. When
/// that header is missing or not RFC 3339, the deadline falls back to `now`,
/// which makes the key selectable again on the next pass.
pub fn capture_state(headers: &HeaderMap, now: DateTime<Utc>) -> CredentialState {
    if !should_retry(headers) || !headers.contains_key(RETRY_AFTER_HEADER) {
        return CredentialState::Valid;
    }

    let retry_after = match headers.get(REQUESTS_RESET_HEADER) {
        None => {
            debug!("throttled response without reset header, retry deadline is now");
            now
        }
        Some(value) => match value
            .to_str()
            .ok()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        {
            Some(reset) => reset.with_timezone(&Utc),
            None => {
                warn!(value = ?value, "unparseable rate-limit reset header, retry deadline is now");
                now
            }
        },
    };

    CredentialState::Expired { retry_after }
}

fn should_retry(headers: &HeaderMap) -> bool {
    headers
        .get_all(SHOULD_RETRY_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.trim().eq_ignore_ascii_case("true"))
}

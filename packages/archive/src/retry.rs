//! HTTP retry helper for transient errors.
//!
//! Every archive request goes through [`send_csv`] instead of calling
//! `reqwest::RequestBuilder::send()` directly, so each one gets
//! automatic retry with exponential backoff for transient failures
//! (timeouts, connection resets, rate limiting, server errors).
//!
//! Validation failures are deliberately *not* handled here: a response
//! that arrives but cannot be parsed is a schema problem, and
//! re-fetching will not fix it.

use std::time::Duration;

use crate::ArchiveError;

/// Maximum number of retry attempts for transient HTTP errors.
///
/// With exponential backoff (2s, 4s, 8s, 16s, 32s) the total wait
/// before giving up is 62 seconds on top of the per-request timeout.
const MAX_RETRIES: u32 = 5;

/// Sends an HTTP request and returns the response body as a `String`
/// (the archive's `ct=csv` payload).
///
/// The `build_request` closure is called on each attempt to construct
/// a fresh [`reqwest::RequestBuilder`], since builders are consumed by
/// `.send()`.
///
/// # Retry behaviour
///
/// Retries up to [`MAX_RETRIES`] times with exponential backoff on
/// connection errors, timeouts, HTTP 429, and HTTP 5xx. Does **not**
/// retry other 4xx — these are permanent.
///
/// # Errors
///
/// Returns [`ArchiveError`] if the request fails after all retries or
/// the server returns a non-retryable status code.
#[allow(clippy::future_not_send)]
pub async fn send_csv<F>(build_request: F) -> Result<String, ArchiveError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_error: Option<ArchiveError> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = Duration::from_secs(1u64 << attempt); // 2s, 4s, 8s
            log::warn!("  retry {attempt}/{MAX_RETRIES} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        let response = match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < MAX_RETRIES {
                    log::warn!("  transient error: {e}");
                    last_error = Some(ArchiveError::Http(e));
                    continue;
                }
                return Err(ArchiveError::Http(e));
            }
            Ok(response) => response,
        };

        let status = response.status();
        let url = response.url().to_string();

        // 429 Too Many Requests and 5xx — retry
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            if attempt < MAX_RETRIES {
                log::warn!("  HTTP {status} from {url}");
                last_error = Some(ArchiveError::Status {
                    status: status.as_u16(),
                    url,
                });
                continue;
            }
            return Err(ArchiveError::Status {
                status: status.as_u16(),
                url,
            });
        }

        // Other 4xx — permanent, don't retry
        if status.is_client_error() {
            return Err(ArchiveError::Status {
                status: status.as_u16(),
                url,
            });
        }

        match response.text().await {
            Ok(text) => return Ok(text),
            Err(e) => {
                // Body cut off mid-transfer reads as a transport error.
                if is_transient(&e) && attempt < MAX_RETRIES {
                    log::warn!("  body read failed from {url}: {e}");
                    last_error = Some(ArchiveError::Http(e));
                    continue;
                }
                return Err(ArchiveError::Http(e));
            }
        }
    }

    // Should be unreachable, but in case the loop exits without returning:
    Err(last_error.unwrap_or(ArchiveError::Malformed {
        message: "request failed after all retries".to_string(),
    }))
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

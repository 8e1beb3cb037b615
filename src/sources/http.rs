use std::error::Error;
use std::time::Duration;

use rand::random;
use reqwest::StatusCode;

use crate::sources::FetchStatus;

const USER_AGENT: &str = concat!("syllabuzz/", env!("CARGO_PKG_VERSION"));

/// Base delay before the first retry
const BACKOFF_BASE_MS: u64 = 1000;

/// Blocking HTTP GET, one attempt per call.
///
/// Retrying is left to the gateway so every attempt goes through the rate
/// limiter. Connect errors, timeouts and 5xx come back marked transient;
/// other 4xx (429 included) do not.
pub struct HttpClient {
    client: reqwest::blocking::Client,
}

pub struct HttpBody {
    pub status: u16,
    pub body: String,
}

fn get_error(error: &reqwest::Error) -> String {
    match error.source() {
        Some(e) => match e.source() {
            Some(e) => e.to_string(),
            None => e.to_string(),
        },
        None => error.to_string(),
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
}

/// Exponential backoff with jitter, `attempt` counted from 1.
pub fn backoff_delay(attempt: u8) -> Duration {
    let exp = BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1) as u32);
    Duration::from_millis(exp + rand_jitter())
}

fn rand_jitter() -> u64 {
    random::<u64>() % 500
}

impl HttpClient {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client })
    }

    pub fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<HttpBody, FetchStatus> {
        let mut req = self.client.get(url).query(query);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }

        let resp = match req.send() {
            Ok(r) => r,
            Err(err) => {
                let message = get_error(&err);
                log::warn!("{url}: {err}: {message}");
                if err.is_timeout() || err.is_connect() || err.is_request() {
                    return Err(FetchStatus::transient(None, message));
                }
                return Err(FetchStatus::failed(None, message));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            log::debug!("{url}: {status}");
            let message = error_message(status, &body);
            return Err(if is_retryable_status(status) {
                FetchStatus::transient(Some(status.as_u16()), message)
            } else {
                FetchStatus::failed(Some(status.as_u16()), message)
            });
        }

        match resp.text() {
            Ok(body) => Ok(HttpBody {
                status: status.as_u16(),
                body,
            }),
            Err(err) => Err(FetchStatus::failed(
                Some(status.as_u16()),
                format!("failed to read body: {}", get_error(&err)),
            )),
        }
    }
}

/// Provider error message from a JSON body, else the status text.
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| status.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_server_errors_retry() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_backoff_grows() {
        let first = backoff_delay(1);
        let third = backoff_delay(3);
        assert!(first >= Duration::from_millis(1000) && first < Duration::from_millis(1500));
        assert!(third >= Duration::from_millis(4000) && third < Duration::from_millis(4500));
    }

    #[test]
    fn test_error_message_prefers_provider_text() {
        let body = r#"{"status":"error","code":"rateLimited","message":"You have made too many requests"}"#;
        assert_eq!(
            error_message(StatusCode::TOO_MANY_REQUESTS, body),
            "You have made too many requests"
        );
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "<html>"), "502 Bad Gateway");
    }
}

//! Status and transport mapping shared by the HTTP engines.

use crate::ProviderError;
use bytes::Bytes;
use reqwest::Response;
use std::time::Duration;

pub(crate) async fn check_status(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
    Err(error_for_status(
        status.as_u16(),
        &String::from_utf8_lossy(&body),
        retry_after.as_deref(),
    ))
}

pub(crate) fn error_for_status(status: u16, body: &str, retry_after: Option<&str>) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthFailure(format!("status {status} body {body}")),
        429 => ProviderError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .or_else(|| retry_after_from_body(body))
                .map(Duration::from_secs),
        },
        408 | 500..=599 => ProviderError::TransportFailure(format!("status {status} body {body}")),
        _ => ProviderError::Rejected(format!("status {status} body {body}")),
    }
}

pub(crate) fn transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else if e.is_decode() {
        ProviderError::TransportFailure(format!("undecodable response: {e}"))
    } else {
        ProviderError::TransportFailure(e.to_string())
    }
}

fn retry_after_from_body(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_terminal() {
        assert!(matches!(
            error_for_status(401, "", None),
            ProviderError::AuthFailure(_)
        ));
        assert!(matches!(
            error_for_status(403, "", None),
            ProviderError::AuthFailure(_)
        ));
    }

    #[test]
    fn rate_limit_reads_header_then_body() {
        let from_header = error_for_status(429, "", Some("7"));
        assert_eq!(from_header.retry_after(), Some(Duration::from_secs(7)));

        let from_body = error_for_status(429, r#"{"error": {"retry_after": 30}}"#, None);
        assert_eq!(from_body.retry_after(), Some(Duration::from_secs(30)));

        let none = error_for_status(429, "slow down", None);
        assert!(matches!(none, ProviderError::RateLimited { retry_after: None }));
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_are_not() {
        assert!(error_for_status(503, "", None).is_transient());
        assert!(error_for_status(408, "", None).is_transient());
        let rejected = error_for_status(400, "bad model", None);
        assert!(matches!(rejected, ProviderError::Rejected(ref m) if m.contains("bad model")));
        assert!(!rejected.is_transient());
    }
}

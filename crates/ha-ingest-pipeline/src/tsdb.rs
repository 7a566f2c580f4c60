//! HTTP client for the time-series store's batched line-protocol write
//! endpoint.
//!
//! Status classification drives the writer's retry decision: 2xx succeeds,
//! 401/403 means the token is bad (permanent), 400/413/422 means the store
//! rejected the payload shape (permanent), and everything else (429, 5xx,
//! transport failures, deadline expiry) is transient and retried.

use reqwest::StatusCode;
use tracing::debug;

use ha_ingest_core::config::TsdbConfig;
use ha_ingest_core::error::{IngestError, IngestResult};

/// Client for the v2 write API.
#[derive(Debug, Clone)]
pub struct TsdbClient {
    http: reqwest::Client,
    write_url: String,
    ping_url: String,
    token: String,
}

impl TsdbClient {
    pub fn new(config: &TsdbConfig) -> IngestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.write_timeout)
            .build()
            .map_err(|e| {
                IngestError::configuration(format!("failed to build TSDB client: {}", e))
            })?;
        let base = config.url.trim_end_matches('/');
        Ok(TsdbClient {
            http,
            write_url: format!(
                "{}/api/v2/write?org={}&bucket={}&precision=ns",
                base, config.org, config.bucket
            ),
            ping_url: format!("{}/ping", base),
            token: config.token.clone(),
        })
    }

    /// Write one encoded batch. The per-flush deadline is the client-wide
    /// request timeout configured at construction.
    pub async fn write_lines(&self, body: String) -> IngestResult<()> {
        let response = self
            .http
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IngestError::transient_network(&self.write_url, "write deadline exceeded")
                } else {
                    IngestError::transient_network(&self.write_url, format!("send failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        debug!(status = %status, detail = %detail, "write rejected");
        Err(classify_status(status, &self.write_url, &detail))
    }

    /// Advisory reachability probe used at startup; never fatal.
    pub async fn ping(&self) -> bool {
        match self.http.get(&self.ping_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

fn classify_status(status: StatusCode, endpoint: &str, detail: &str) -> IngestError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => IngestError::authentication(
            endpoint,
            format!("{}: {}", status, truncate(detail, 200)),
        ),
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            IngestError::persistence_permanent(
                "tsdb",
                format!("{}: {}", status, truncate(detail, 200)),
            )
        }
        _ => IngestError::transient_network(
            endpoint,
            format!("{}: {}", status, truncate(detail, 200)),
        ),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Dead-letter reason for a write failure.
pub fn dead_letter_reason(err: &IngestError) -> &'static str {
    match err {
        IngestError::Authentication { .. } => "tsdb:auth",
        IngestError::Persistence { permanent: true, .. } => "tsdb:schema",
        _ => "tsdb:write",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(url: &str) -> TsdbConfig {
        TsdbConfig {
            url: url.to_string(),
            token: "secret".to_string(),
            org: "home".to_string(),
            bucket: "telemetry".to_string(),
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            retry_buffer_batches: 100,
        }
    }

    #[test]
    fn builds_write_url_with_org_bucket_and_precision() {
        let client = TsdbClient::new(&config("http://influx:8086/")).unwrap();
        assert_eq!(
            client.write_url,
            "http://influx:8086/api/v2/write?org=home&bucket=telemetry&precision=ns"
        );
    }

    #[test]
    fn schema_rejections_are_permanent() {
        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "url", "bad field type");
        assert!(matches!(
            err,
            IngestError::Persistence { permanent: true, .. }
        ));
        assert_eq!(dead_letter_reason(&err), "tsdb:schema");
    }

    #[test]
    fn auth_rejections_map_to_authentication() {
        let err = classify_status(StatusCode::UNAUTHORIZED, "url", "bad token");
        assert!(matches!(err, IngestError::Authentication { .. }));
        assert_eq!(dead_letter_reason(&err), "tsdb:auth");
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let err = classify_status(status, "url", "");
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
    }
}

//! Conditional feed fetching.
//!
//! One fetch is one conditional GET plus parse plus cache-control
//! computation. Nothing here persists or retries; the scheduler owns both.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use super::parser::{self, ParseError};

/// Fallback re-fetch interval when neither an `Expires` header nor a channel
/// TTL is present.
const DEFAULT_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, timeout).
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Body was not structurally valid XML.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

/// A successfully fetched and normalized feed.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub version: Option<String>,
    pub channel: Map<String, Value>,
    pub items: Vec<Map<String, Value>>,
    /// When this fetch completed (epoch ms).
    pub last_read: i64,
    /// When the feed may next be re-fetched (epoch ms).
    pub expires: i64,
    /// Validator from the response, for the next conditional GET.
    pub etag: Option<String>,
}

/// Outcome of a fetch attempt that completed at the HTTP level.
#[derive(Debug)]
pub enum FetchOutcome {
    Fresh(Box<FetchedFeed>),
    /// Non-2xx status; no body was parsed. The caller decides backoff.
    Failed(u16),
}

/// Fetch `url`, sending `If-None-Match` when an etag is known.
///
/// On a 2xx response the body is parsed and `expires` computed: the
/// `Expires` response header when it parses, else now plus the channel's
/// declared TTL (minutes), else now plus 60 minutes.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    etag: Option<&str>,
) -> Result<FetchOutcome, FetchError> {
    let mut request = client.get(url);
    if let Some(etag) = etag {
        request = request.header(reqwest::header::IF_NONE_MATCH, etag);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        tracing::debug!(url = %url, status = %status, "feed fetch returned non-success");
        return Ok(FetchOutcome::Failed(status.as_u16()));
    }

    let header_expires = response
        .headers()
        .get(reqwest::header::EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);
    let response_etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let body = response.bytes().await?;
    let parsed = parser::parse(&body)?;

    let now = Utc::now().timestamp_millis();
    let expires = header_expires.unwrap_or_else(|| now + ttl_ms(&parsed.channel));

    Ok(FetchOutcome::Fresh(Box::new(FetchedFeed {
        version: parsed.version,
        channel: parsed.channel,
        items: parsed.items,
        last_read: now,
        expires,
        etag: response_etag,
    })))
}

/// Channel-declared TTL in minutes, defaulting to an hour.
fn ttl_ms(channel: &Map<String, Value>) -> i64 {
    channel
        .get("ttl")
        .and_then(Value::as_str)
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|minutes| *minutes > 0)
        .map(|minutes| minutes * 60 * 1000)
        .unwrap_or(DEFAULT_TTL_MS)
}

fn parse_http_date(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test</title><link>http://x/</link>
    <item><title>One</title><link>http://x/1</link></item>
</channel></rss>"#;

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn success_parses_and_defaults_expiry_to_an_hour() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let before = now_ms();
        let outcome = fetch(&client, &format!("{}/feed", server.uri()), None)
            .await
            .unwrap();
        let after = now_ms();

        let feed = match outcome {
            FetchOutcome::Fresh(feed) => feed,
            other => panic!("expected fresh feed, got {:?}", other),
        };
        assert_eq!(feed.version.as_deref(), Some("2.0"));
        assert_eq!(feed.items.len(), 1);
        assert!(feed.last_read >= before && feed.last_read <= after);
        assert!(feed.expires >= before + DEFAULT_TTL_MS);
        assert!(feed.expires <= after + DEFAULT_TTL_MS);
        assert_eq!(feed.etag, None);
    }

    #[tokio::test]
    async fn channel_ttl_drives_expiry() {
        let rss = r#"<rss version="2.0"><channel>
            <title>T</title><link>http://x/</link><ttl>2</ttl>
        </channel></rss>"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let before = now_ms();
        let outcome = fetch(&client, &server.uri(), None).await.unwrap();

        let FetchOutcome::Fresh(feed) = outcome else {
            panic!("expected fresh feed");
        };
        // two minutes, not the one-hour default; the 5-minute floor is the
        // scheduler's concern
        assert!(feed.expires >= before + 2 * 60 * 1000);
        assert!(feed.expires < before + 3 * 60 * 1000);
    }

    #[tokio::test]
    async fn expires_header_wins_over_ttl() {
        let rss = r#"<rss version="2.0"><channel>
            <title>T</title><link>http://x/</link><ttl>2</ttl>
        </channel></rss>"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss)
                    .insert_header("Expires", "Mon, 06 Sep 2100 00:00:00 GMT"),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = fetch(&client, &server.uri(), None).await.unwrap();

        let FetchOutcome::Fresh(feed) = outcome else {
            panic!("expected fresh feed");
        };
        let expected = DateTime::parse_from_rfc2822("Mon, 06 Sep 2100 00:00:00 GMT")
            .unwrap()
            .timestamp_millis();
        assert_eq!(feed.expires, expected);
    }

    #[tokio::test]
    async fn response_etag_is_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = fetch(&client, &server.uri(), None).await.unwrap();

        let FetchOutcome::Fresh(feed) = outcome else {
            panic!("expected fresh feed");
        };
        assert_eq!(feed.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn known_etag_is_sent_conditionally() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = fetch(&client, &server.uri(), Some("\"v1\"")).await.unwrap();

        assert!(matches!(outcome, FetchOutcome::Failed(304)));
    }

    #[tokio::test]
    async fn non_success_status_is_reported_without_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = fetch(&client, &server.uri(), None).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Failed(404)));
    }

    #[tokio::test]
    async fn invalid_body_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss><broken"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = fetch(&client, &server.uri(), None).await;
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn connection_failure_is_a_network_error() {
        // Nothing listens here.
        let client = reqwest::Client::new();
        let result = fetch(&client, "http://127.0.0.1:1/feed", None).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
    }
}

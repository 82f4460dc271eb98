//! Shared HTTP plumbing for adapters
//!
//! One request per call, no retries here; retrying belongs to
//! [`Resilience`](crate::resilience::Resilience).

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{FetchError, FetchResult};

/// User agent sent to every provider.
pub const USER_AGENT: &str = concat!("mdp-ingest/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by adapters
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Append path segments to a base URL, keeping any path the base already has
pub fn endpoint(base: &Url, segments: &[&str]) -> FetchResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| FetchError::fatal(format!("base URL '{}' cannot carry a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Parse a `Retry-After` header given as delta-seconds or an HTTP date
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

fn classify(response: Response, context: &str) -> FetchResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(FetchError::from_status(
        status,
        retry_after(response.headers()),
        context,
    ))
}

async fn send(client: &Client, url: Url) -> FetchResult<Response> {
    let context = format!("GET {}", url.path());
    let response = client.get(url).send().await?;
    classify(response, &context)
}

/// GET a JSON document; an undecodable body is fatal for the page
pub async fn get_json(client: &Client, url: Url) -> FetchResult<Value> {
    let body = get_text(client, url).await?;
    serde_json::from_str(&body).map_err(|e| FetchError::fatal(format!("malformed JSON: {}", e)))
}

/// GET a JSON document; `None` on 404, for APIs that signal "no results" that way
pub async fn get_json_if_found(client: &Client, url: Url) -> FetchResult<Option<Value>> {
    let context = format!("GET {}", url.path());
    let response = client.get(url).send().await?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let body = classify(response, &context)?.text().await?;
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| FetchError::fatal(format!("malformed JSON: {}", e)))
}

/// GET a text document
pub async fn get_text(client: &Client, url: Url) -> FetchResult<String> {
    let response = send(client, url).await?;
    Ok(response.text().await?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let base = Url::parse("https://api.obis.org/v3/").unwrap();
        let url = endpoint(&base, &["occurrence"]).unwrap();
        assert_eq!(url.as_str(), "https://api.obis.org/v3/occurrence");

        let base = Url::parse("https://www.ndbc.noaa.gov").unwrap();
        let url = endpoint(&base, &["data", "realtime2", "46042.txt"]).unwrap();
        assert_eq!(url.as_str(), "https://www.ndbc.noaa.gov/data/realtime2/46042.txt");
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_retry_after_missing_or_garbage() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}

use crate::error::DownloadError;
use chrono::Utc;
use log::debug;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use url::Url;

/// Outcome of capability discovery against an origin server.
#[derive(Debug, Clone, Copy)]
pub struct ServerCapabilities {
    /// Size of the full resource; 0 when the server revealed nothing.
    pub total_bytes: u64,
    /// Whether the origin honors `Range: bytes=` requests.
    pub supports_resume: bool,
}

/// Appends the `_t=<unix-ms>` cache-busting query parameter to a URL.
///
/// Defeats intermediate caches and stale keep-alive connections; the store
/// keyspace keeps the original URL.
pub fn cache_busted(url: &str) -> Result<String, DownloadError> {
    let mut parsed = Url::parse(url)?;
    parsed
        .query_pairs_mut()
        .append_pair("_t", &Utc::now().timestamp_millis().to_string());
    Ok(parsed.into())
}

/// Extracts the total from a `Content-Range` value (`bytes a-b/total`).
///
/// Returns `None` for the unknown-length form `bytes */.` or anything
/// unparseable.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.split_once('/')?;
    let total = total.trim();
    if total == "*" {
        return None;
    }
    total.parse::<u64>().ok()
}

fn header_u64(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<u64> {
    resp.headers()
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

fn advertises_byte_ranges(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
}

/// Learns `total_bytes` and byte-range support for `url`.
///
/// Strategy A issues a HEAD probe; on a non-2xx response or transport error
/// it falls back to strategy B, a `Range: bytes=0-0` GET whose status is
/// inspected as soon as headers arrive. A 200 there means the server ignored
/// the range; the body is not drained.
pub async fn discover(client: &Client, url: &str) -> Result<ServerCapabilities, DownloadError> {
    match client.head(url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let total_bytes = header_u64(&resp, CONTENT_LENGTH).unwrap_or(0);
            let supports_resume = resp.status() == StatusCode::PARTIAL_CONTENT
                || advertises_byte_ranges(&resp);
            debug!(
                "HEAD probe for {}: total={} resume={}",
                url, total_bytes, supports_resume
            );
            Ok(ServerCapabilities {
                total_bytes,
                supports_resume,
            })
        }
        Ok(resp) => {
            debug!(
                "HEAD probe for {} returned {}, falling back to range probe",
                url,
                resp.status()
            );
            range_probe(client, url).await
        }
        Err(e) => {
            debug!("HEAD probe for {} failed ({}), falling back to range probe", url, e);
            range_probe(client, url).await
        }
    }
}

async fn range_probe(client: &Client, url: &str) -> Result<ServerCapabilities, DownloadError> {
    let busted = cache_busted(url)?;
    let resp = client
        .get(&busted)
        .header(RANGE, "bytes=0-0")
        .send()
        .await?;

    match resp.status() {
        StatusCode::PARTIAL_CONTENT => {
            let total_bytes = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(0);
            debug!("range probe for {}: 206, total={}", url, total_bytes);
            Ok(ServerCapabilities {
                total_bytes,
                supports_resume: true,
            })
        }
        StatusCode::OK => {
            // Server ignored the range; take the length if offered and drop
            // the response without draining the body.
            let total_bytes = header_u64(&resp, CONTENT_LENGTH).unwrap_or(0);
            drop(resp);
            debug!("range probe for {}: 200, total={}", url, total_bytes);
            Ok(ServerCapabilities {
                total_bytes,
                supports_resume: false,
            })
        }
        status => Err(DownloadError::Http {
            status: status.as_u16(),
            text: status.to_string(),
        }),
    }
}

//! Metadata probe: find the total size of a remote resource.

use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use smasher_shared::errors::DownloadError;
use tracing::debug;

/// Probe `url` for its total size in bytes.
///
/// Prefers a HEAD request. Servers that block HEAD or omit `Content-Length`
/// get a one-byte ranged GET, whose `Content-Range` total is used instead.
/// Fails with `SizeUnknown` if neither reports a length.
pub async fn probe_size(client: &reqwest::Client, url: &str) -> Result<u64, DownloadError> {
    match client.head(url).send().await {
        Ok(resp) if resp.status().is_success() => {
            // `Response::content_length` reflects the (empty) HEAD body, so read the header.
            if let Some(len) = parse_len(resp.headers().get(CONTENT_LENGTH)) {
                debug!("HEAD {} reported {} bytes", url, len);
                return Ok(len);
            }
        }
        Ok(resp) => debug!("HEAD {} returned {}, falling back to ranged GET", url, resp.status()),
        Err(e) => debug!("HEAD {} failed ({}), falling back to ranged GET", url, e),
    }

    let resp = client
        .get(url)
        .header(RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|e| DownloadError::Probe(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(DownloadError::Probe(format!("GET {} returned {}", url, status)));
    }

    let len = match status {
        StatusCode::PARTIAL_CONTENT => parse_total_from_content_range(resp.headers().get(CONTENT_RANGE)),
        // A 200 means the range was ignored and the full body's length is the total.
        _ => parse_len(resp.headers().get(CONTENT_LENGTH)),
    };

    len.ok_or_else(|| DownloadError::SizeUnknown { url: url.to_string() })
}

fn parse_len(v: Option<&HeaderValue>) -> Option<u64> {
    v.and_then(|hv| hv.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// `bytes 0-0/12345` -> 12345; `bytes 0-0/*` -> None.
fn parse_total_from_content_range(v: Option<&HeaderValue>) -> Option<u64> {
    let s = v?.to_str().ok()?;
    let (_, total) = s.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

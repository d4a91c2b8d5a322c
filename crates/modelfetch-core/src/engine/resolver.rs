//! File name resolution from a small range probe

use crate::error::FetchError;
use reqwest::header::{CONTENT_DISPOSITION, RANGE};
use reqwest::Client;
use tracing::{debug, info};

/// Range requested by the probe; only the headers matter
const PROBE_RANGE: &str = "bytes=0-10";

/// Parse and validate a download URL
pub fn parse_url(url: &str) -> Result<url::Url, FetchError> {
    let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::InvalidUrl(format!(
            "{}: unsupported scheme '{}'",
            url, other
        ))),
    }
}

/// Ask the server for the file name it would serve `url` under
pub async fn resolve_file_name(client: &Client, url: &str) -> Result<String, FetchError> {
    let parsed = parse_url(url)?;
    info!("Probing {} for file name", parsed);

    let response = client
        .get(parsed.as_str())
        .header(RANGE, PROBE_RANGE)
        .send()
        .await?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(FetchError::NotFound {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let header = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .ok_or_else(|| FetchError::NameResolution("missing content-disposition header".into()))?;
    let header = header
        .to_str()
        .map_err(|_| FetchError::NameResolution("content-disposition is not valid text".into()))?;
    debug!("content-disposition: {}", header);

    let name = parse_content_disposition(header)
        .ok_or_else(|| FetchError::NameResolution(format!("no filename in '{}'", header)))?;
    sanitize_file_name(&name)
        .ok_or_else(|| FetchError::NameResolution(format!("unusable filename '{}'", name)))
}

/// Extract the file name from a `Content-Disposition` value.
///
/// An RFC 5987 `filename*=` parameter wins over a plain `filename=`.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    if let Some(extended) = disposition_param(value, "filename*=") {
        // charset'language'percent-encoded
        let encoded = extended.splitn(3, '\'').nth(2).unwrap_or(extended.as_str());
        if let Ok(decoded) = urlencoding::decode(encoded) {
            if !decoded.is_empty() {
                return Some(decoded.into_owned());
            }
        }
    }

    disposition_param(value, "filename=").filter(|name| !name.is_empty())
}

fn disposition_param(value: &str, key: &str) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let mut from = 0;

    while let Some(pos) = lower[from..].find(key) {
        let start = from + pos;
        let before = lower[..start].trim_end();
        from = start + key.len();

        // Must begin a parameter, not sit inside another one's value
        if !(before.is_empty() || before.ends_with(';')) {
            continue;
        }

        let rest = value[from..].trim_start();
        if let Some(quoted) = rest.strip_prefix('"') {
            return quoted.find('"').map(|end| quoted[..end].to_string());
        }
        let end = rest.find(';').unwrap_or(rest.len());
        return Some(rest[..end].trim().to_string());
    }

    None
}

/// Reduce a server- or user-supplied name to a bare file name.
///
/// Directory components are dropped so the result always stays inside the
/// target directory.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('\0');

    match base {
        "" | "." | ".." => None,
        _ => Some(base.to_string()),
    }
}

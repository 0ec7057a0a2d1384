//! Remote size probing.
//!
//! Tries HEAD first and trusts a positive `Content-Length`. Some origins
//! behind the SOCKS circuits strip or mis-report `Content-Length` on HEAD
//! but still honor single-byte ranges, so the fallback issues
//! `GET Range: bytes=0-0`, requires 206, and reads the total from the
//! `/<total>` tail of `Content-Range`.

use anyhow::{bail, Context, Result};
use curl::easy::Easy;
use std::str;

use crate::client::HttpClient;

/// Determine the total byte length of the remote file.
///
/// Runs blocking curl transfers in the current thread; call from
/// `spawn_blocking` when used from async code.
pub fn remote_file_size(client: &HttpClient, url: &str) -> Result<u64> {
    match head_content_length(client, url) {
        Ok(Some(size)) => return Ok(size),
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(error = %e, "HEAD probe failed, falling back to range probe");
        }
    }

    range_probe_total(client, url).context("remote file size unknown")
}

/// HEAD request; `Ok(Some(n))` only for a positive `Content-Length`.
fn head_content_length(client: &HttpClient, url: &str) -> Result<Option<u64>> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = Easy::new();
    client.apply(&mut easy)?;
    easy.url(url).context("invalid URL")?;
    easy.nobody(true)?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            collect_header_line(&mut headers, data);
            true
        })?;
        transfer.perform().context("HEAD request failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if !(200..300).contains(&code) {
        bail!("HEAD {} returned HTTP {}", url, code);
    }

    Ok(header_value(&headers, "content-length").and_then(|v| parse_content_length(&v)))
}

/// `GET Range: bytes=0-0`; requires 206 and a parseable `Content-Range`
/// total. The one-byte body is discarded.
fn range_probe_total(client: &HttpClient, url: &str) -> Result<u64> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = Easy::new();
    client.apply(&mut easy)?;
    easy.url(url).context("invalid URL")?;
    easy.range("0-0")?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            collect_header_line(&mut headers, data);
            true
        })?;
        transfer.write_function(|data| Ok(data.len()))?;
        transfer.perform().context("range probe failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if code != 206 {
        bail!("server did not honor range request (HTTP {})", code);
    }

    let value = header_value(&headers, "content-range")
        .context("missing Content-Range header in range probe response")?;
    let total = parse_content_range_total(&value)?;
    if total == 0 {
        bail!("remote size is zero");
    }
    Ok(total)
}

/// Append one raw header line. When curl follows redirects it emits one
/// header block per hop; clearing on each HTTP status line keeps only the
/// final response's headers.
fn collect_header_line(headers: &mut Vec<String>, data: &[u8]) {
    if let Ok(s) = str::from_utf8(data) {
        let line = s.trim_end();
        if line.starts_with("HTTP/") {
            headers.clear();
        }
        headers.push(line.to_string());
    }
}

fn header_value(lines: &[String], name: &str) -> Option<String> {
    for line in lines {
        if let Some((n, value)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Positive decimal `Content-Length` values only; zero and garbage are
/// treated as absent so the caller falls back to the range probe.
fn parse_content_length(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|n| *n > 0)
}

/// Parse the `/<total>` tail of a `Content-Range` value, e.g.
/// `bytes 0-0/12345`. Rejects `*` (unknown total) and malformed values.
fn parse_content_range_total(value: &str) -> Result<u64> {
    let (_, total) = value
        .split_once('/')
        .with_context(|| format!("invalid Content-Range header: {}", value))?;
    let total = total.trim();
    if total == "*" {
        bail!("unknown total size in Content-Range header");
    }
    total
        .parse::<u64>()
        .with_context(|| format!("invalid Content-Range total: {}", total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parses_valid_header() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345").unwrap(), 12345);
        assert_eq!(parse_content_range_total("bytes 0-1023/5000000").unwrap(), 5_000_000);
    }

    #[test]
    fn content_range_total_rejects_star() {
        assert!(parse_content_range_total("bytes 0-0/*").is_err());
    }

    #[test]
    fn content_range_total_rejects_malformed() {
        assert!(parse_content_range_total("bytes 0-0").is_err());
        assert!(parse_content_range_total("bytes 0-0/abc").is_err());
    }

    #[test]
    fn content_length_requires_positive_value() {
        assert_eq!(parse_content_length("12345"), Some(12345));
        assert_eq!(parse_content_length(" 7 "), Some(7));
        assert_eq!(parse_content_length("0"), None);
        assert_eq!(parse_content_length("-3"), None);
        assert_eq!(parse_content_length("banana"), None);
    }

    #[test]
    fn header_lines_reset_on_redirect_block() {
        let mut headers = Vec::new();
        collect_header_line(&mut headers, b"HTTP/1.1 302 Found\r\n");
        collect_header_line(&mut headers, b"Location: /elsewhere\r\n");
        collect_header_line(&mut headers, b"HTTP/1.1 206 Partial Content\r\n");
        collect_header_line(&mut headers, b"Content-Range: bytes 0-0/99\r\n");
        assert_eq!(header_value(&headers, "location"), None);
        assert_eq!(
            header_value(&headers, "content-range").as_deref(),
            Some("bytes 0-0/99")
        );
    }
}

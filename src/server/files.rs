//! Range-aware file responses
//!
//! Streams cached OGG files with `Accept-Ranges`/`Content-Range` handling so
//! readers can seek and resume.

use std::path::Path;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// A parsed single byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    /// Inclusive
    end: u64,
}

/// Parse a `bytes=start-end` header against a file length.
/// Multi-range requests fall back to the full file.
fn parse_range(header: &str, len: u64) -> Option<ByteRange> {
    if len == 0 {
        return None;
    }
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_raw, end_raw) = spec.split_once('-')?;
    if start_raw.is_empty() {
        // Suffix form: last N bytes
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        let start = len.saturating_sub(suffix);
        return Some(ByteRange {
            start,
            end: len - 1,
        });
    }
    let start: u64 = start_raw.parse().ok()?;
    if start >= len {
        return None;
    }
    let end: u64 = if end_raw.is_empty() {
        len - 1
    } else {
        end_raw.parse::<u64>().ok()?.min(len - 1)
    };
    if end < start {
        return None;
    }
    Some(ByteRange { start, end })
}

/// Serve a file with optional Range support and extra headers
pub async fn serve_file(
    path: &Path,
    content_type: &str,
    request_headers: &HeaderMap,
    extra_headers: Vec<(header::HeaderName, HeaderValue)>,
) -> Response {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let len = metadata.len();

    let range = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| (raw, parse_range(raw, len)));

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes");
    for (name, value) in extra_headers {
        builder = builder.header(name, value);
    }

    match range {
        Some((_, Some(range))) => {
            if file.seek(std::io::SeekFrom::Start(range.start)).await.is_err() {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            let span = range.end - range.start + 1;
            let stream = ReaderStream::new(file.take(span));
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, span)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, len),
                )
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Some((_, None)) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", len))
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        None => {
            let stream = ReaderStream::new(file);
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, len)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_range_forms() {
        assert_eq!(
            parse_range("bytes=0-99", 1000),
            Some(ByteRange { start: 0, end: 99 })
        );
        assert_eq!(
            parse_range("bytes=500-", 1000),
            Some(ByteRange {
                start: 500,
                end: 999
            })
        );
        assert_eq!(
            parse_range("bytes=-100", 1000),
            Some(ByteRange {
                start: 900,
                end: 999
            })
        );
    }

    #[test]
    fn test_range_clamped_to_length() {
        assert_eq!(
            parse_range("bytes=0-5000", 1000),
            Some(ByteRange { start: 0, end: 999 })
        );
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        assert_eq!(parse_range("bytes=0-1,5-9", 1000), None);
        assert_eq!(parse_range("items=0-1", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
        assert_eq!(parse_range("bytes=0-10", 0), None);
    }
}

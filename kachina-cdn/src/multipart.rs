//! multipart/byteranges body parsing
//!
//! A multi-range request may be answered with a single
//! `multipart/byteranges` body: parts delimited by `--boundary` lines,
//! each carrying its own headers (notably `Content-Range`) and raw bytes.

use tracing::trace;

use crate::client::parse_content_range;
use crate::error::{Error, Result};

/// Extract the boundary parameter from a multipart Content-Type
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/byteranges") {
        return None;
    }
    for param in parts {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Parse a multipart/byteranges body into `(offset, bytes)` parts
pub fn parse_byteranges(body: &[u8], boundary: &str) -> Result<Vec<(u64, Vec<u8>)>> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut pos = 0usize;

    loop {
        let delim_at = find(body, pos, delimiter.as_bytes())
            .ok_or_else(|| Error::invalid_multipart("missing boundary delimiter"))?;
        let mut cursor = delim_at + delimiter.len();

        // Closing delimiter is `--boundary--`
        if body[cursor..].starts_with(b"--") {
            break;
        }
        cursor = skip_crlf(body, cursor)?;

        // Part headers up to the blank line
        let mut content_range = None;
        loop {
            let line_end = find(body, cursor, b"\r\n")
                .ok_or_else(|| Error::invalid_multipart("unterminated part header"))?;
            if line_end == cursor {
                cursor += 2;
                break;
            }
            let line = std::str::from_utf8(&body[cursor..line_end])
                .map_err(|_| Error::invalid_multipart("non-UTF-8 part header"))?;
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-range") {
                    content_range = parse_content_range(value.trim());
                }
            }
            cursor = line_end + 2;
        }

        let (start, end, _) = content_range
            .ok_or_else(|| Error::invalid_multipart("part without Content-Range"))?;
        let len = (end - start + 1) as usize;
        if cursor + len > body.len() {
            return Err(Error::invalid_multipart("part body truncated"));
        }

        trace!("multipart part: offset={start}, len={len}");
        parts.push((start, body[cursor..cursor + len].to_vec()));
        pos = cursor + len;
    }

    if parts.is_empty() {
        return Err(Error::invalid_multipart("no parts in body"));
    }
    Ok(parts)
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn skip_crlf(body: &[u8], pos: usize) -> Result<usize> {
    if body[pos..].starts_with(b"\r\n") {
        Ok(pos + 2)
    } else {
        Err(Error::invalid_multipart("boundary not followed by CRLF"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Encode parts the way a range-capable server would
    fn encode(boundary: &str, parts: &[(u64, &[u8])], total: u64) -> Vec<u8> {
        let mut body = Vec::new();
        for (offset, data) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
            body.extend_from_slice(
                format!(
                    "Content-Range: bytes {}-{}/{}\r\n\r\n",
                    offset,
                    offset + data.len() as u64 - 1,
                    total
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    #[test]
    fn test_boundary_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/byteranges; boundary=SEP"),
            Some("SEP".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/byteranges; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(boundary_from_content_type("application/octet-stream"), None);
    }

    #[test]
    fn test_parse_two_parts() {
        let body = encode("SEP", &[(10, b"abcdef"), (100, b"XYZ")], 4096);
        let parts = parse_byteranges(&body, "SEP").unwrap();
        assert_eq!(parts, vec![(10, b"abcdef".to_vec()), (100, b"XYZ".to_vec())]);
    }

    #[test]
    fn test_binary_part_bodies_survive() {
        // Bodies containing CRLF and boundary-like bytes parse by length,
        // not by delimiter search.
        let tricky = b"\r\n--SEP\r\n\x00\xFFdata";
        let body = encode("SEP", &[(0, tricky)], 64);
        let parts = parse_byteranges(&body, "SEP").unwrap();
        assert_eq!(parts, vec![(0, tricky.to_vec())]);
    }

    #[test]
    fn test_missing_content_range_rejected() {
        let body =
            b"--SEP\r\nContent-Type: application/octet-stream\r\n\r\nabc\r\n--SEP--\r\n".to_vec();
        assert!(parse_byteranges(&body, "SEP").is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut body = encode("SEP", &[(0, b"0123456789")], 64);
        body.truncate(body.len() - 20);
        assert!(parse_byteranges(&body, "SEP").is_err());
    }
}

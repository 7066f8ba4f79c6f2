//! Range-capable static file responder for wiremock

use wiremock::{Request, Respond, ResponseTemplate};

/// Serves one fixture buffer with full `Range` header support:
/// single ranges, suffix ranges and multi-range requests answered as
/// `multipart/byteranges`.
pub struct RangeFileResponder {
    body: Vec<u8>,
}

impl RangeFileResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    fn slice(&self, start: u64, end: u64) -> (u64, u64, &[u8]) {
        let len = self.body.len() as u64;
        let end = end.min(len.saturating_sub(1));
        (start, end, &self.body[start as usize..=end as usize])
    }

    fn parse_spec(&self, spec: &str) -> Option<(u64, u64)> {
        let len = self.body.len() as u64;
        if let Some(suffix) = spec.strip_prefix('-') {
            let n: u64 = suffix.parse().ok()?;
            return Some((len.saturating_sub(n), len.saturating_sub(1)));
        }
        let (start, end) = spec.split_once('-')?;
        let start: u64 = start.parse().ok()?;
        let end: u64 = if end.is_empty() {
            len.saturating_sub(1)
        } else {
            end.parse().ok()?
        };
        (start < len).then_some((start, end))
    }
}

impl Respond for RangeFileResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let range_header = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="));

        let Some(specs) = range_header else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };

        let ranges: Option<Vec<(u64, u64)>> =
            specs.split(',').map(|s| self.parse_spec(s.trim())).collect();
        let Some(ranges) = ranges else {
            return ResponseTemplate::new(416);
        };

        if ranges.len() == 1 {
            let (start, end, slice) = self.slice(ranges[0].0, ranges[0].1);
            return ResponseTemplate::new(206)
                .insert_header("Content-Range", format!("bytes {start}-{end}/{total}").as_str())
                .set_body_bytes(slice.to_vec());
        }

        let boundary = "KACHINA_TEST_BOUNDARY";
        let mut body = Vec::new();
        for (start, end) in ranges {
            let (start, end, slice) = self.slice(start, end);
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
            body.extend_from_slice(
                format!("Content-Range: bytes {start}-{end}/{total}\r\n\r\n").as_bytes(),
            );
            body.extend_from_slice(slice);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        ResponseTemplate::new(206)
            .insert_header(
                "Content-Type",
                format!("multipart/byteranges; boundary={boundary}").as_str(),
            )
            .set_body_bytes(body)
    }
}

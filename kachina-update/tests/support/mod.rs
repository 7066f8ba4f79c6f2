//! Shared test fixtures: package building and a range-capable responder

use std::path::{Path, PathBuf};

use wiremock::{Request, Respond, ResponseTemplate};

use kachina_builder::{
    HashTreeOptions, PackRequest, assemble_manifest, compute_deletes, diff_tree, hash_tree,
    hash_tree_only,
};
use kachina_format::HashAlgorithm;

/// Deterministic pseudo-random bytes for incompressible fixtures
pub fn lcg_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
    let mut data = vec![0u8; len];
    for byte in &mut data {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        *byte = (state >> 56) as u8;
    }
    data
}

/// Write a file, creating parents
pub fn write(dir: &Path, rel: &str, data: &[u8]) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

/// Build a package from a source tree, optionally diffed against a
/// previous tree. Returns the package path; staging stays inside `work`.
pub async fn build_package(
    tree: &Path,
    prev: Option<&Path>,
    tag: &str,
    work: &Path,
) -> PathBuf {
    let staging = work.join(format!("staging-{tag}"));
    std::fs::create_dir_all(&staging).unwrap();

    let options = HashTreeOptions {
        installer_name: Some("updater.exe".to_string()),
        ..Default::default()
    };
    let hashed = hash_tree(tree, &staging, &options).await.unwrap();

    let (patches, deletes) = match prev {
        Some(prev_dir) => {
            let patches = diff_tree(
                &[prev_dir],
                tree,
                &hashed,
                HashAlgorithm::Md5,
                &staging,
                2,
            )
            .await
            .unwrap();
            let prev_hashed = hash_tree_only(prev_dir, HashAlgorithm::Md5, 2).await.unwrap();
            (patches, compute_deletes(&prev_hashed, &hashed))
        }
        None => (Vec::new(), Vec::new()),
    };

    let manifest = assemble_manifest(tag, hashed, patches, deletes).unwrap();

    let stub_path = work.join(format!("stub-{tag}.exe"));
    let mut stub = b"MZ".to_vec();
    stub.extend_from_slice(&[0u8; 510]);
    std::fs::write(&stub_path, stub).unwrap();

    let out = work.join(format!("test-app-{tag}.exe"));
    kachina_builder::pack(&PackRequest {
        stub: &stub_path,
        config: br#"{"name":"test-app","reg_name":"TestApp","updater_name":"updater.exe"}"#,
        theme: None,
        metadata: Some(&manifest),
        hashed_dir: Some(&staging),
        out: &out,
    })
    .unwrap();
    out
}

/// Serves one fixture buffer with full `Range` header support
pub struct RangeFileResponder {
    body: Vec<u8>,
}

impl RangeFileResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
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
        (start < len).then_some((start, end.min(len.saturating_sub(1))))
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
            let (start, end) = ranges[0];
            return ResponseTemplate::new(206)
                .insert_header(
                    "Content-Range",
                    format!("bytes {start}-{end}/{total}").as_str(),
                )
                .set_body_bytes(self.body[start as usize..=end as usize].to_vec());
        }

        let boundary = "KACHINA_TEST_BOUNDARY";
        let mut body = Vec::new();
        for (start, end) in ranges {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(
                format!("Content-Range: bytes {start}-{end}/{total}\r\n\r\n").as_bytes(),
            );
            body.extend_from_slice(&self.body[start as usize..=end as usize]);
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

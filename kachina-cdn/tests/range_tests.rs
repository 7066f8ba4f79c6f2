//! Integration tests for the range client and remote package reader

mod support;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use kachina_cdn::{HttpClient, RemotePackage};
use kachina_format::{Footer, IndexEntry, SEG_CONFIG, SEG_INDEX, SEG_META, segment_len};

use support::RangeFileResponder;

async fn serve(body: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg.exe"))
        .respond_with(RangeFileResponder::new(body))
        .mount(&server)
        .await;
    server
}

fn fixture(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_single_range_fetch() {
    let body = fixture(1 << 16);
    let server = serve(body.clone()).await;
    let client = HttpClient::new().unwrap();

    let url = format!("{}/pkg.exe", server.uri());
    let got = client.get_range(&url, 1000, 500).await.unwrap();
    assert_eq!(&got[..], &body[1000..1500]);
}

#[tokio::test]
async fn test_suffix_range_reports_total() {
    let body = fixture(1 << 16);
    let server = serve(body.clone()).await;
    let client = HttpClient::new().unwrap();

    let url = format!("{}/pkg.exe", server.uri());
    let (tail, total) = client.get_suffix(&url, 128).await.unwrap();
    assert_eq!(total, body.len() as u64);
    assert_eq!(&tail[..], &body[body.len() - 128..]);
}

#[tokio::test]
async fn test_multi_range_fetch_via_multipart() {
    let body = fixture(1 << 16);
    let server = serve(body.clone()).await;
    let client = HttpClient::new().unwrap();

    let url = format!("{}/pkg.exe", server.uri());
    let ranges = [(100u64, 50u64), (5000, 200), (60000, 16)];
    let parts = client.get_ranges(&url, &ranges).await.unwrap();

    assert_eq!(parts.len(), 3);
    for ((offset, length), part) in ranges.iter().zip(&parts) {
        let offset = *offset as usize;
        assert_eq!(&part[..], &body[offset..offset + *length as usize]);
    }
}

/// Build a tiny but well-formed package file for remote header discovery
fn build_remote_package(stub_len: usize) -> (Vec<u8>, Vec<u8>) {
    let stub = vec![0x4Du8; stub_len];
    let config = br#"{"name":"demo"}"#.to_vec();
    let meta = br#"{"tag_name":"1.0.0","hashed":[]}"#.to_vec();
    let payload = b"zstd-compressed-payload-bytes".to_vec();

    let entry = IndexEntry {
        name: "cafebabe".to_string(),
        size: payload.len() as u32,
        offset: 0,
    };
    let index_payload_len = 1 + entry.name.len() + 8;

    let config_size = segment_len(SEG_CONFIG, config.len());
    let index_size = segment_len(SEG_INDEX, index_payload_len);
    let meta_size = segment_len(SEG_META, meta.len());
    let region_len = config_size + index_size + meta_size;

    let entries = vec![IndexEntry {
        offset: region_len as u32,
        ..entry
    }];

    let mut out = stub.clone();
    kachina_format::segment::write_segment(&mut out, SEG_CONFIG, &config).unwrap();
    kachina_format::segment::write_segment(
        &mut out,
        SEG_INDEX,
        &kachina_format::write_index(&entries).unwrap(),
    )
    .unwrap();
    kachina_format::segment::write_segment(&mut out, SEG_META, &meta).unwrap();
    out.extend_from_slice(&payload);
    Footer {
        payload_start: stub.len() as u32,
        config_size: config_size as u32,
        theme_size: 0,
        index_size: index_size as u32,
        metadata_size: meta_size as u32,
    }
    .write(&mut out)
    .unwrap();
    (out, payload)
}

#[tokio::test]
async fn test_remote_package_discovery_via_tail() {
    // Large stub: discovery needs the head probe plus a suffix request.
    let (package, payload) = build_remote_package(64 * 1024);
    let server = serve(package).await;
    let client = HttpClient::new().unwrap();

    let url = format!("{}/pkg.exe", server.uri());
    let remote = RemotePackage::open(&client, &url).await.unwrap();
    assert_eq!(
        remote.parsed().manifest().unwrap().unwrap().tag_name,
        "1.0.0"
    );
    assert_eq!(
        remote.read_payload(&client, "cafebabe").await.unwrap(),
        payload
    );
}

#[tokio::test]
async fn test_remote_package_discovery_head_only() {
    // Tiny stub: the whole file fits in the 256-byte probe.
    let (package, _) = build_remote_package(8);
    assert!(package.len() <= 256);
    let server = serve(package).await;
    let client = HttpClient::new().unwrap();

    let url = format!("{}/pkg.exe", server.uri());
    let remote = RemotePackage::open(&client, &url).await.unwrap();
    assert_eq!(remote.parsed().entries().len(), 1);
}

#[tokio::test]
async fn test_first_probe_is_head_range() {
    let (package, _) = build_remote_package(64 * 1024);
    let server = serve(package).await;
    let client = HttpClient::new().unwrap();

    let url = format!("{}/pkg.exe", server.uri());
    RemotePackage::open(&client, &url).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let first_range = requests[0]
        .headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert_eq!(first_range, "bytes=0-255");
}

//! Remote package reader
//!
//! Parses a package hosted behind an HTTP range server into the same
//! header view the local self-reader produces, without ever downloading
//! the payload region. Discovery is two or three small range requests:
//! the first 256 bytes (enough when the stub plus footer fit), otherwise
//! a suffix window for the footer, then the segment region.

use tracing::debug;

use kachina_format::{Footer, ParsedPackage};

use crate::client::HttpClient;
use crate::error::{Error, Result};

/// First-request probe size; covers footer-only and tiny-stub packages
const HEAD_PROBE_LEN: u64 = 256;

/// Suffix window requested when the probe does not hold the footer
const TAIL_WINDOW: u64 = 4096;

/// A package parsed over HTTP ranges
#[derive(Debug, Clone)]
pub struct RemotePackage {
    url: String,
    parsed: ParsedPackage,
}

impl RemotePackage {
    /// Discover and parse a remote package header
    pub async fn open(client: &HttpClient, url: &str) -> Result<Self> {
        let (head, total) = client.get_range_with_total(url, 0, HEAD_PROBE_LEN).await?;

        let footer = if total <= HEAD_PROBE_LEN {
            // The whole file fit in the probe.
            Footer::locate(&head)?
        } else {
            let tail_len = TAIL_WINDOW.min(total);
            let (tail, _) = client.get_suffix(url, tail_len).await?;
            Footer::locate(&tail)?
        };
        footer.check_against_file(total)?;
        debug!("remote footer located: {footer:?}, file size {total}");

        let (region_start, region_end) = footer.segment_region();
        let region = client
            .get_range(url, region_start, region_end - region_start)
            .await?;

        let parsed = ParsedPackage::from_parts(footer, &region, total)?;
        Ok(Self {
            url: url.to_string(),
            parsed,
        })
    }

    /// URL the package was opened from
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The parsed header view
    pub fn parsed(&self) -> &ParsedPackage {
        &self.parsed
    }

    /// Absolute `(offset, size)` of a payload for range fetches
    pub fn payload_range(&self, name: &str) -> Result<(u64, u64)> {
        self.parsed
            .payload_range(name)
            .ok_or_else(|| Error::Format(kachina_format::Error::payload_not_found(name)))
    }

    /// Download a whole payload into memory
    pub async fn read_payload(&self, client: &HttpClient, name: &str) -> Result<Vec<u8>> {
        let (offset, size) = self.payload_range(name)?;
        Ok(client.get_range(&self.url, offset, size).await?.to_vec())
    }
}

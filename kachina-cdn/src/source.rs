//! Pluggable update sources
//!
//! Turning "a package URL" into "a sequence of fetchable chunk URLs" is
//! source-specific: a plain static file server needs nothing, a
//! session-gated CDN needs a handshake before the first chunk. The core
//! defines one small trait, selects an implementation by URL scheme
//! prefix, and ships the direct-HTTP and session-based variants.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use kachina_format::Manifest;

use crate::client::HttpClient;
use crate::error::{Error, Result};
use crate::remote::RemotePackage;

/// A resolver from package URL to manifest and chunk URLs
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Stable identifier, used in logs and error hints
    fn id(&self) -> &'static str;

    /// Fetch the manifest this source serves
    async fn resolve_metadata(&self, client: &HttpClient) -> Result<Manifest>;

    /// URL that byte-range requests for payloads go to
    async fn resolve_chunk_url(&self, client: &HttpClient) -> Result<String>;

    /// Establish per-source state before the first chunk fetch
    async fn create_session(&self, _client: &HttpClient) -> Result<()> {
        Ok(())
    }

    /// Tear down per-source state after the run
    async fn end_session(&self, _client: &HttpClient) -> Result<()> {
        Ok(())
    }
}

/// Select a source implementation by URL scheme prefix
pub fn resolve_source(url: &str, extras: Option<serde_json::Value>) -> Result<Box<dyn UpdateSource>> {
    if let Some(rest) = url.strip_prefix("session+") {
        return Ok(Box::new(SessionSource::new(rest.to_string(), extras)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(DirectSource::new(url.to_string())));
    }
    Err(Error::UnknownSourceScheme {
        url: url.to_string(),
    })
}

/// Plain HTTP(S) source: the package URL is the chunk URL
#[derive(Debug)]
pub struct DirectSource {
    package_url: String,
}

impl DirectSource {
    /// Create a direct source for a hosted package
    pub fn new(package_url: String) -> Self {
        Self { package_url }
    }
}

#[async_trait]
impl UpdateSource for DirectSource {
    fn id(&self) -> &'static str {
        "direct"
    }

    async fn resolve_metadata(&self, client: &HttpClient) -> Result<Manifest> {
        let package = RemotePackage::open(client, &self.package_url).await?;
        package
            .parsed()
            .manifest()?
            .ok_or_else(|| Error::invalid_response("remote package carries no metadata segment"))
    }

    async fn resolve_chunk_url(&self, _client: &HttpClient) -> Result<String> {
        Ok(self.package_url.clone())
    }
}

/// Challenge announced by a session endpoint
#[derive(Debug, Deserialize)]
struct SessionChallenge {
    /// Challenge kind: `md5`, `sha256` or `web`
    #[serde(rename = "type")]
    kind: String,
    /// Server-chosen challenge data
    data: String,
}

#[derive(Debug, Deserialize)]
struct SessionGrant {
    sid: String,
    /// Chunk URL the session is valid for; defaults to the package URL
    #[serde(default)]
    url: Option<String>,
}

/// Session-gated source: handshake first, then ranged chunk fetches
///
/// The endpoint hands out a challenge; the answer is the lowercase hex
/// digest of the challenge data under the announced algorithm. `web`
/// challenges need a browser round-trip and are surfaced as unsolvable
/// here rather than silently hanging.
pub struct SessionSource {
    package_url: String,
    extras: Option<serde_json::Value>,
    session: Mutex<Option<SessionGrant>>,
}

impl SessionSource {
    /// Create a session source for a `session+https://...` URL
    pub fn new(package_url: String, extras: Option<serde_json::Value>) -> Self {
        Self {
            package_url,
            extras,
            session: Mutex::new(None),
        }
    }

    fn session_endpoint(&self) -> String {
        format!("{}/session", self.package_url.trim_end_matches('/'))
    }

    fn solve(&self, challenge: &SessionChallenge) -> Result<String> {
        match challenge.kind.as_str() {
            "md5" => Ok(format!("{:x}", md5::compute(challenge.data.as_bytes()))),
            "sha256" => {
                let mut hasher = Sha256::new();
                hasher.update(challenge.data.as_bytes());
                Ok(hex::encode(hasher.finalize()))
            }
            other => Err(Error::UnsolvableChallenge {
                source_id: self.id().to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl UpdateSource for SessionSource {
    fn id(&self) -> &'static str {
        "session"
    }

    async fn resolve_metadata(&self, client: &HttpClient) -> Result<Manifest> {
        let chunk_url = self.resolve_chunk_url(client).await?;
        let package = RemotePackage::open(client, &chunk_url).await?;
        package
            .parsed()
            .manifest()?
            .ok_or_else(|| Error::invalid_response("remote package carries no metadata segment"))
    }

    async fn resolve_chunk_url(&self, client: &HttpClient) -> Result<String> {
        if self.session.lock().is_none() {
            self.create_session(client).await?;
        }
        let guard = self.session.lock();
        let grant = guard.as_ref().ok_or_else(|| {
            Error::session_protocol(self.id(), "session handshake did not yield a grant")
        })?;
        let base = grant.url.clone().unwrap_or_else(|| self.package_url.clone());
        let separator = if base.contains('?') { '&' } else { '?' };
        Ok(format!("{base}{separator}sid={}", grant.sid))
    }

    async fn create_session(&self, client: &HttpClient) -> Result<()> {
        let endpoint = self.session_endpoint();
        let body = client.get(&endpoint).await?.bytes().await?;
        let challenge: SessionChallenge = serde_json::from_slice(&body)
            .map_err(|e| Error::session_protocol(self.id(), format!("challenge parse failed: {e}")))?;
        debug!(source = self.id(), "session challenge kind {:?}", challenge.kind);

        let answer = self.solve(&challenge)?;
        let mut body = serde_json::json!({
            "challenge": challenge.data,
            "answer": answer,
        });
        if let Some(extras) = &self.extras {
            body["extras"] = extras.clone();
        }

        let grant_body = client.post_json(&endpoint, &body).await?.bytes().await?;
        let grant: SessionGrant = serde_json::from_slice(&grant_body)
            .map_err(|e| Error::session_protocol(self.id(), format!("grant parse failed: {e}")))?;
        debug!(source = self.id(), "session established: sid {}", grant.sid);

        *self.session.lock() = Some(grant);
        Ok(())
    }

    async fn end_session(&self, client: &HttpClient) -> Result<()> {
        let sid = match self.session.lock().take() {
            Some(grant) => grant.sid,
            None => return Ok(()),
        };
        let url = format!("{}/{sid}", self.session_endpoint());
        if let Err(e) = client.delete(&url).await {
            // Session expiry on the server handles leftovers.
            warn!(source = self.id(), "session teardown failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_selection() {
        assert_eq!(
            resolve_source("https://host/pkg.exe", None).unwrap().id(),
            "direct"
        );
        assert_eq!(
            resolve_source("session+https://host/pkg.exe", None)
                .unwrap()
                .id(),
            "session"
        );
        assert!(resolve_source("ftp://host/pkg.exe", None).is_err());
    }

    #[test]
    fn test_challenge_solving() {
        let source = SessionSource::new("https://host/pkg.exe".to_string(), None);

        let md5_challenge = SessionChallenge {
            kind: "md5".to_string(),
            data: "hello world".to_string(),
        };
        assert_eq!(
            source.solve(&md5_challenge).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );

        let sha_challenge = SessionChallenge {
            kind: "sha256".to_string(),
            data: "hello world".to_string(),
        };
        assert_eq!(
            source.solve(&sha_challenge).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let web_challenge = SessionChallenge {
            kind: "web".to_string(),
            data: String::new(),
        };
        match source.solve(&web_challenge) {
            Err(Error::UnsolvableChallenge { source_id, kind }) => {
                assert_eq!(source_id, "session");
                assert_eq!(kind, "web");
            }
            other => panic!("expected unsolvable challenge, got {other:?}"),
        }
    }
}

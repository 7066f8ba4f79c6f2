//! Run-wide context
//!
//! Everything install-run-global travels in one explicit value: the
//! shared HTTP client, the cancellation token and the progress channel.
//! Nothing here is a process global, which keeps test harnesses able to
//! run many installs side by side.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kachina_cdn::HttpClient;

use crate::error::Result;

/// Progress event emitted by workers at short intervals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Normalized target file name
    pub file_name: String,
    /// Bytes downloaded for this file so far
    pub bytes_downloaded: u64,
}

/// Shared state of one install run
#[derive(Debug, Clone)]
pub struct UpdateContext {
    /// Shared HTTP client (connection pool, keep-alive)
    pub http: HttpClient,
    /// Global cancellation signal
    pub cancel: CancellationToken,
    /// Progress sink; `None` for silent runs
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl UpdateContext {
    /// Create a context with a fresh client and no progress sink
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: HttpClient::new().map_err(crate::error::UpdateError::Download)?,
            cancel: CancellationToken::new(),
            progress: None,
        })
    }

    /// Attach a progress channel, returning the receiver
    pub fn with_progress(mut self) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress = Some(tx);
        (self, rx)
    }

    /// Emit a progress event, ignoring a closed receiver
    pub fn emit_progress(&self, file_name: &str, bytes_downloaded: u64) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent {
                file_name: file_name.to_string(),
                bytes_downloaded,
            });
        }
    }

    /// Error out early when the run has been cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(crate::error::UpdateError::Cancelled);
        }
        Ok(())
    }
}

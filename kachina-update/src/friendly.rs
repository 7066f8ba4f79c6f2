//! User-facing error mapping
//!
//! Wire errors are meaningless to most users; the mapper turns the
//! common ones into actionable hints. The original error text is always
//! appended so reports stay debuggable.

use crate::error::UpdateError;

/// Map an error to a user-facing message with the original appended
pub fn friendly_message(error: &UpdateError) -> String {
    let hint = hint_for(error);
    match hint {
        Some(hint) => format!("{hint} ({error})"),
        None => error.to_string(),
    }
}

fn hint_for(error: &UpdateError) -> Option<&'static str> {
    match error {
        UpdateError::Download(e) => hint_for_download(e),
        UpdateError::TaskFailed { source, .. } => hint_for(source),
        UpdateError::LockedFiles { .. } => Some(
            "Some files are in use by another program. Close the application and try again",
        ),
        UpdateError::HashMismatch { .. } => {
            Some("A downloaded file was corrupted in transit. Try again or switch download source")
        }
        UpdateError::MissingUninstallMetadata => {
            Some("The installation records are missing; reinstall to repair them")
        }
        UpdateError::CorruptInstall { .. } => {
            Some("The local installation looks damaged; a reinstall is required")
        }
        _ => None,
    }
}

fn hint_for_download(error: &kachina_cdn::Error) -> Option<&'static str> {
    match error {
        kachina_cdn::Error::Http(e) if e.is_connect() => {
            Some("Download server problem; check your connection or switch source")
        }
        kachina_cdn::Error::Http(e) if e.is_timeout() => {
            Some("The download server is responding slowly; try again or switch source")
        }
        kachina_cdn::Error::Stalled { .. } => {
            Some("The download stalled; check your connection or switch source")
        }
        kachina_cdn::Error::RateLimited { .. } => {
            Some("The download server is rate limiting; wait a moment and retry")
        }
        kachina_cdn::Error::NotFound { .. } => {
            Some("The update is not available on this source; switch source")
        }
        kachina_cdn::Error::RangeNotSupported { .. } => {
            Some("This download source does not support resumable transfers; switch source")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_text_always_present() {
        let error = UpdateError::LockedFiles {
            paths: vec!["app.exe".to_string()],
        };
        let message = friendly_message(&error);
        assert!(message.contains("Close the application"));
        assert!(message.contains("app.exe"));
    }

    #[test]
    fn test_task_failure_unwraps_to_inner_hint() {
        let error = UpdateError::TaskFailed {
            file: "data.bin".to_string(),
            attempts: 3,
            source: Box::new(UpdateError::HashMismatch {
                file: "data.bin".to_string(),
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            }),
        };
        assert!(friendly_message(&error).contains("corrupted in transit"));
    }

    #[test]
    fn test_unmapped_errors_pass_through() {
        let error = UpdateError::Cancelled;
        assert_eq!(friendly_message(&error), "update cancelled");
    }
}

use reqwest::StatusCode;

use crate::{NetworkError, UploadOutcome};

/// Maps a response status to an outcome.
///
/// 2xx succeeds. 5xx, 408 and 429 may succeed later. Everything else,
/// including 1xx and unfollowed 3xx, will not.
pub fn classify_status(status: StatusCode) -> UploadOutcome {
    if status.is_success() {
        UploadOutcome::Success {
            status: status.as_u16(),
        }
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        UploadOutcome::RetryableFailure {
            reason: format!("server responded {status}"),
        }
    } else {
        UploadOutcome::PermanentFailure {
            reason: format!("server responded {status}"),
        }
    }
}

/// Maps a transport error to a network error.
///
/// Requests that could not be built or redirected are permanent; connect,
/// timeout and body errors are retryable.
pub fn classify_error(err: &reqwest::Error) -> NetworkError {
    if err.is_builder() || err.is_redirect() {
        NetworkError::Permanent(err.to_string())
    } else {
        NetworkError::Retryable(err.to_string())
    }
}

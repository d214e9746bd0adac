//! Error types for storage API calls and listing sessions

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Network unreachable, timeout, connection reset
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The API answered with `success=false`; the message is shown verbatim
    #[error("{message}")]
    Api { message: String },
    #[error("unexpected response ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn api(message: impl Into<String>) -> Self {
        ApiError::Api {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ListingError {
    #[error("bucket must not be empty")]
    EmptyBucket,
    #[error("prefix must be empty or end with '{delimiter}': {prefix}")]
    InvalidPrefix { prefix: String, delimiter: char },
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ListingError {
    /// Human-readable notice for the user. API messages are passed through
    /// untouched, transport failures get a generic notice.
    pub fn notice(&self) -> String {
        match self {
            ListingError::Api(ApiError::Api { message }) => message.clone(),
            ListingError::Api(ApiError::Transport(_)) => {
                "failed to load file list: network unavailable".to_string()
            }
            other => format!("failed to load file list: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_message_is_verbatim() {
        let err = ListingError::from(ApiError::api("bucket does not exist"));
        assert_eq!(err.notice(), "bucket does not exist");
    }

    #[test]
    fn test_invalid_prefix_notice() {
        let err = ListingError::InvalidPrefix {
            prefix: "docs".to_string(),
            delimiter: '/',
        };
        assert!(err.notice().contains("docs"));
    }
}

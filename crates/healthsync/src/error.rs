//! Classified errors for entrypoints and uploads

/// Configuration problems rejected before a sync pass starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Backend host is not configured")]
    MissingHost,

    #[error("Invalid backend host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("Invalid endpoint template: {reason}")]
    InvalidEndpointTemplate { reason: String },

    #[error("No user is signed in")]
    MissingUser,

    #[error("Access token is missing")]
    MissingToken,

    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("No data types are tracked")]
    NoTrackedTypes,
}

/// Failure delivering a staged outbox item
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The request never produced an HTTP response
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Staged files or the anchor store could not be read or written
    #[error("Outbox storage error: {0}")]
    Storage(String),
}

impl UploadError {
    /// 401: the token must be refreshed before retrying
    pub fn is_auth(&self) -> bool {
        matches!(self, UploadError::Status { status: 401, .. })
    }

    /// Whether the same item may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Transport(_) | UploadError::Storage(_) => true,
            UploadError::Status { status, .. } => *status != 401,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_error_classification() {
        let unauthorized = UploadError::Status {
            status: 401,
            body: String::new(),
        };
        assert!(unauthorized.is_auth());
        assert!(!unauthorized.is_retryable());

        let server = UploadError::Status {
            status: 503,
            body: "busy".to_string(),
        };
        assert!(!server.is_auth());
        assert!(server.is_retryable());
        assert_eq!(server.status(), Some(503));

        let transport = UploadError::Transport("timed out".to_string());
        assert!(transport.is_retryable());
        assert_eq!(transport.status(), None);
    }
}

use thiserror::Error;

/// Error taxonomy shared by the agent and the director.
///
/// `Warning` is not a failure: the operation went through but the caller
/// should log something noteworthy. It travels on the wire as an `OK` reply
/// carrying a `warning` field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenbachError {
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Warning: {message}")]
    Warning { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Unreachable: {message}")]
    Unreachable { message: String },

    #[error("Unprocessable: {message}")]
    Unprocessable { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl OpenbachError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::Unprocessable {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Raw message without the category prefix, as sent in replies.
    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message }
            | Self::Warning { message }
            | Self::NotFound { message }
            | Self::Unreachable { message }
            | Self::Unprocessable { message }
            | Self::Internal { message } => message,
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Failures of the framed transport itself.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message truncated before reading the whole content. Expected {expected} bytes but read {read}")]
    Truncated { expected: usize, read: usize },

    #[error("Frame of {size} bytes exceeds the {max} bytes limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {millis} ms while {operation}")]
    Timeout { operation: String, millis: u64 },
}

impl From<TransportError> for OpenbachError {
    fn from(error: TransportError) -> Self {
        OpenbachError::unreachable(error.to_string())
    }
}

pub type OpenbachResult<T> = Result<T, OpenbachError>;
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_strips_category() {
        let error = OpenbachError::bad_request("Job iperf3 requires at least 2 arguments");
        assert_eq!(error.message(), "Job iperf3 requires at least 2 arguments");
        assert!(error.to_string().starts_with("Bad request"));
    }

    #[test]
    fn test_transport_error_is_unreachable() {
        let error: OpenbachError = TransportError::Truncated {
            expected: 12,
            read: 3,
        }
        .into();
        assert!(error.is_unreachable());
        assert!(error.message().contains("Expected 12 bytes but read 3"));
    }
}

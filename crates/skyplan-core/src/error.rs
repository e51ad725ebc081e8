//! Error types shared by every skyplan crate

use thiserror::Error;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// E001: No usable credentials were found
    E001CredentialsMissing,
    /// E002: Credentials were rejected by the identity endpoint
    E002CredentialsInvalid,
    /// E003: Intent, name or identifier is malformed
    E003InvalidInput,
    /// E004: Cloud API returned a non-success response
    E004RemoteApi,
    /// E005: Resource does not exist
    E005NotFound,
    /// E006: Eventual-consistency or throttling error that exhausted its retries
    E006TransientConsistency,
    /// E007: A batch operation partially failed
    E007PartialBatchFailure,
    /// E008: State document is locked by another owner
    E008StateLocked,
    /// E009: Operation was cancelled
    E009Cancelled,
    /// E010: Network or local I/O failure
    E010Transport,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E001CredentialsMissing => "E001",
            Self::E002CredentialsInvalid => "E002",
            Self::E003InvalidInput => "E003",
            Self::E004RemoteApi => "E004",
            Self::E005NotFound => "E005",
            Self::E006TransientConsistency => "E006",
            Self::E007PartialBatchFailure => "E007",
            Self::E008StateLocked => "E008",
            Self::E009Cancelled => "E009",
            Self::E010Transport => "E010",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while planning or provisioning
#[derive(Debug, Error)]
pub enum SkyError {
    /// Access key or secret key could not be located
    #[error("credentials missing: {reason}")]
    CredentialsMissing { reason: String },

    /// The identity probe rejected the credentials
    #[error("credentials invalid: {reason}")]
    CredentialsInvalid { reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid bucket name '{name}': {reason}")]
    InvalidBucketName { name: String, reason: String },

    #[error("invalid image id '{0}': expected ami- followed by 17 lowercase hex digits")]
    InvalidImageId(String),

    /// Parsed error envelope from a cloud API
    #[error("{}", remote_message(.status, .service, .code, .message))]
    RemoteApi {
        status: u16,
        service: String,
        code: String,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    /// Consistency or throttling error that outlived its retry budget
    #[error("transient error persisted after retries: {0}")]
    TransientConsistency(String),

    /// Some items of a batch failed; the rest succeeded
    #[error("{operation} failed for {} item(s): {}", .failed.len(), .failed.join(", "))]
    PartialBatchFailure {
        operation: String,
        failed: Vec<String>,
    },

    #[error("state '{key}' is locked by {locked_by}")]
    StateLocked { key: String, locked_by: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

fn remote_message(status: &u16, service: &str, code: &str, message: &str) -> String {
    if code.is_empty() {
        format!("{} returned HTTP {}: {}", service, status, message)
    } else {
        format!("{}: {}", code, message)
    }
}

const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchEntity",
    "NoSuchKey",
    "NoSuchBucket",
    "NoSuchUpload",
    "NotFound",
    "ResourceNotFoundException",
    "ParameterNotFound",
];

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "SlowDown",
    "RequestThrottled",
    "ConcurrentModification",
];

impl SkyError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn remote(
        status: u16,
        service: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::RemoteApi {
            status,
            service: service.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CredentialsMissing { .. } => ErrorCode::E001CredentialsMissing,
            Self::CredentialsInvalid { .. } => ErrorCode::E002CredentialsInvalid,
            Self::InvalidInput(_) | Self::InvalidBucketName { .. } | Self::InvalidImageId(_) => {
                ErrorCode::E003InvalidInput
            }
            Self::RemoteApi { .. } => ErrorCode::E004RemoteApi,
            Self::NotFound(_) | Self::RoleNotFound(_) => ErrorCode::E005NotFound,
            Self::TransientConsistency(_) => ErrorCode::E006TransientConsistency,
            Self::PartialBatchFailure { .. } => ErrorCode::E007PartialBatchFailure,
            Self::StateLocked { .. } => ErrorCode::E008StateLocked,
            Self::Cancelled => ErrorCode::E009Cancelled,
            Self::Transport(_) | Self::Io { .. } | Self::Serialization(_) => {
                ErrorCode::E010Transport
            }
        }
    }

    /// Process exit code: 2 invalid input, 3 credentials, 4 remote failure, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.code() {
            ErrorCode::E003InvalidInput => 2,
            ErrorCode::E001CredentialsMissing | ErrorCode::E002CredentialsInvalid => 3,
            ErrorCode::E004RemoteApi
            | ErrorCode::E005NotFound
            | ErrorCode::E006TransientConsistency
            | ErrorCode::E007PartialBatchFailure
            | ErrorCode::E008StateLocked => 4,
            ErrorCode::E009Cancelled | ErrorCode::E010Transport => 1,
        }
    }

    /// HTTP status of a remote error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteApi { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Parsed cloud error code (e.g. `NoSuchBucket`) of a remote error
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::RemoteApi { code, .. } if !code.is_empty() => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::RoleNotFound(_) => true,
            Self::RemoteApi { status, code, .. } => {
                *status == 404 || NOT_FOUND_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// Throttling, 5xx and consistency errors that a caller may retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientConsistency(_) => true,
            Self::RemoteApi { status, code, .. } => {
                *status >= 500 || *status == 429 || THROTTLING_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SkyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for SkyError
pub type Result<T> = std::result::Result<T, SkyError>;

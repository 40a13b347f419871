use thiserror::Error;
use uuid::Uuid;

pub type QeResult<T> = Result<T, QeError>;

/// Stable numeric codes reported to clients. Client libraries branch on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const SAFE_CONTENT_RENAME: ErrorCode = ErrorCode(6371506);
    pub const SAFE_CONTENT_MODIFY: ErrorCode = ErrorCode(6371507);
    pub const MULTI_DOCUMENT_UNSUPPORTED: ErrorCode = ErrorCode(6371300);
    pub const DUPLICATE_KEY: ErrorCode = ErrorCode(11000);
    pub const GENERIC: ErrorCode = ErrorCode(1);
}

/// Ways a client can try to tamper with the safe-content array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyViolation {
    /// `$rename` with the safe-content field as source or target
    Rename,
    /// any other client write to the safe-content field
    Modify,
}

impl std::fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyViolation::Rename => write!(f, "cannot rename the safe-content field"),
            SafetyViolation::Modify => write!(f, "cannot modify the safe-content field"),
        }
    }
}

#[derive(Debug, Error)]
pub enum QeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key not found: {0}")]
    KeyNotFound(Uuid),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("duplicate key in collection {collection}")]
    DuplicateKey {
        collection: String,
        /// Caller-chosen code the duplicate was translated to, if any
        code: Option<i32>,
    },

    #[error("safe-content violation: {0}")]
    SafetyViolation(SafetyViolation),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("multi-document writes are not supported on encrypted collections")]
    MultiDocumentUnsupported,

    #[error("config error: {0}")]
    Config(String),
}

impl QeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        QeError::InvalidInput(msg.into())
    }

    /// The code reported to the client for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            QeError::SafetyViolation(SafetyViolation::Rename) => ErrorCode::SAFE_CONTENT_RENAME,
            QeError::SafetyViolation(SafetyViolation::Modify) => ErrorCode::SAFE_CONTENT_MODIFY,
            QeError::MultiDocumentUnsupported => ErrorCode::MULTI_DOCUMENT_UNSUPPORTED,
            QeError::DuplicateKey { code: Some(code), .. } => ErrorCode(*code),
            QeError::DuplicateKey { code: None, .. } => ErrorCode::DUPLICATE_KEY,
            _ => ErrorCode::GENERIC,
        }
    }
}

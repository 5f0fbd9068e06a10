use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize)]
pub enum CommonError {
    #[error("could not find resource: {msg}")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("authentication failed: {msg}")]
    AuthenticationFailed {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("validation failed: {msg}")]
    ValidationFailed {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("conflict: {msg}")]
    Conflict {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("fatal: {msg}")]
    Fatal {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error")]
    Unknown(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
    #[error("repository error")]
    Repository {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("sqlite database error")]
    SqliteError {
        #[serde(skip)]
        #[from]
        #[source]
        source: libsql::Error,
    },
    #[error("io error")]
    IoError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::io::Error,
    },
    #[error("url parse error")]
    UrlParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: url::ParseError,
    },
    #[error("libsql migration error")]
    LibsqlMigrationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: libsql_migration::errors::LibsqlDirMigratorError,
    },
}

/// Coarse classification of a [`CommonError`], for callers that branch on the
/// kind of failure rather than its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AuthenticationFailed,
    ValidationFailed,
    Conflict,
    Fatal,
    Internal,
}

impl CommonError {
    pub fn not_found(msg: impl Into<String>, lookup_id: impl Into<String>) -> Self {
        CommonError::NotFound {
            msg: msg.into(),
            lookup_id: lookup_id.into(),
            source: None,
        }
    }

    pub fn authentication_failed(msg: impl Into<String>) -> Self {
        CommonError::AuthenticationFailed {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn validation_failed(msg: impl Into<String>) -> Self {
        CommonError::ValidationFailed {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CommonError::Conflict {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CommonError::Fatal {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CommonError::NotFound { .. } => ErrorKind::NotFound,
            CommonError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            CommonError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            CommonError::Conflict { .. } => ErrorKind::Conflict,
            CommonError::Fatal { .. } => ErrorKind::Fatal,
            CommonError::Unknown(_)
            | CommonError::Repository { .. }
            | CommonError::SqliteError { .. }
            | CommonError::IoError { .. }
            | CommonError::UrlParseError { .. }
            | CommonError::LibsqlMigrationError { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Converts the error into the body handed to callers outside the process.
    ///
    /// Decryption failures caused by a missing key and by failed authentication
    /// share one name and message, so a caller cannot probe which versions exist
    /// or tell tampering apart from absence.
    pub fn to_external(&self) -> ErrorResponse {
        let (name, message) = match self {
            CommonError::NotFound { .. } | CommonError::AuthenticationFailed { .. } => (
                "decryption_failed",
                "the ciphertext could not be decrypted".to_string(),
            ),
            CommonError::ValidationFailed { msg, .. } => ("validation_failed", msg.clone()),
            CommonError::Conflict { msg, .. } => ("conflict", msg.clone()),
            CommonError::Fatal { .. } => ("unavailable", "service unavailable".to_string()),
            CommonError::Unknown(_)
            | CommonError::Repository { .. }
            | CommonError::SqliteError { .. }
            | CommonError::IoError { .. }
            | CommonError::UrlParseError { .. }
            | CommonError::LibsqlMigrationError { .. } => {
                ("internal_server_error", "internal server error".to_string())
            }
        };

        ErrorResponse {
            name: name.to_string(),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub name: String,
    pub message: String,
}

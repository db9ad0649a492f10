//! Error taxonomy for the state store, backup codec and import reconciler.
//!
//! Display strings are shown to the user as-is. Decryption failures share a
//! single message whatever the cause; the cause is only kept for logs.

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StorageUnavailable,
    InvalidFormat,
    DecryptionFailed,
    ValidationFailed,
    ExportFailed,
}

/// Why an encrypted backup could not be opened. Never shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptCause {
    Truncated,
    Authentication,
    Payload,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("This doesn't look like a BesideYou backup file.")]
    InvalidFormat { reason: String },

    #[error("Wrong passphrase or corrupted file")]
    DecryptionFailed { cause: DecryptCause },

    #[error("{0}")]
    ValidationFailed(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            BackupError::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            BackupError::DecryptionFailed { .. } => ErrorKind::DecryptionFailed,
            BackupError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            BackupError::ExportFailed(_) => ErrorKind::ExportFailed,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        debug!(%reason, "rejected backup file");
        BackupError::InvalidFormat { reason }
    }
}

pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_message_does_not_leak_cause() {
        let auth = BackupError::DecryptionFailed { cause: DecryptCause::Authentication };
        let short = BackupError::DecryptionFailed { cause: DecryptCause::Truncated };
        assert_eq!(auth.to_string(), short.to_string());
        assert_eq!(auth.kind(), ErrorKind::DecryptionFailed);
    }

    #[test]
    fn invalid_format_message_is_gentle() {
        let err = BackupError::invalid("app marker missing");
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
        assert!(err.to_string().contains("doesn't look like a BesideYou backup"));
    }
}

//! Error types for Postbox

use thiserror::Error;

/// Main error type shared by Postbox collaborators
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No such folder: {0}")]
    NoSuchFolder(String),

    #[error("Mailbox quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Message refused: {0}")]
    MessageRefused(String),

    #[error("Mailbox unavailable: {0}")]
    MailboxUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Postbox
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure lies with the receiving system rather than with
    /// the message or the address.
    ///
    /// Receiver's faults are answered with a temporary failure so that the
    /// sending MTA retries later.
    pub fn is_receivers_fault(&self) -> bool {
        match self {
            Error::Config(_)
            | Error::Database(_)
            | Error::Storage(_)
            | Error::Io(_)
            | Error::MailboxUnavailable(_)
            | Error::Internal(_)
            | Error::Other(_) => true,
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::NoSuchFolder(_)
            | Error::QuotaExceeded(_)
            | Error::MessageRefused(_) => false,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::NoSuchFolder(_) => "NO_SUCH_FOLDER",
            Error::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Error::MessageRefused(_) => "MESSAGE_REFUSED",
            Error::MailboxUnavailable(_) => "MAILBOX_UNAVAILABLE",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

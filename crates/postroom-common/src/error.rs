//! Error types for Postroom

use thiserror::Error;

/// Main error type for Postroom
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Chat transport error: {0}")]
    Chat(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Postroom
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the SMTP reply code used when this error ends an SMTP transaction
    pub fn smtp_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 550,
            Error::PermissionDenied(_) => 554,
            Error::Validation(_) => 550,
            Error::Auth(_) => 535,
            Error::Config(_)
            | Error::Storage(_)
            | Error::Smtp(_)
            | Error::Chat(_)
            | Error::Delivery(_)
            | Error::Internal(_)
            | Error::Other(_) => 451,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Smtp(_) => "SMTP_ERROR",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::PermissionDenied(_) => "FORBIDDEN",
            Error::Chat(_) => "CHAT_ERROR",
            Error::Delivery(_) => "DELIVERY_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_status_mapping() {
        assert_eq!(Error::NotFound("mailbox".into()).smtp_status(), 550);
        assert_eq!(Error::PermissionDenied("banned".into()).smtp_status(), 554);
        assert_eq!(Error::Storage("down".into()).smtp_status(), 451);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Chat("x".into()).code(), "CHAT_ERROR");
        assert_eq!(Error::Other(anyhow::anyhow!("boom")).code(), "INTERNAL_ERROR");
    }
}

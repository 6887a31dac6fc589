//! Error types for the relay

use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Token request {0} is no longer pending")]
    Expired(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using the relay's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a not-found error for an entity kind and id
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("Mobile device", "1234");
        assert_eq!(err.to_string(), "Mobile device not found: 1234");
        assert!(err.is_not_found());
        assert!(!Error::Conflict("x".into()).is_not_found());
    }
}

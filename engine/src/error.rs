//! Error types for the Tether engine.

use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Mutation errors
    #[error("node is read-only: /{0}")]
    ReadOnlyViolation(String),

    #[error("node has been disposed")]
    NodeDisposed,

    // Derived value errors
    #[error("computed evaluation failed: {0}")]
    ComputeFailed(String),

    // Field transform errors
    #[error("invalid field map: {0}")]
    InvalidFieldMap(String),

    // Persistence format errors
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl Error {
    /// Build a [`Error::ReadOnlyViolation`] for a node path.
    pub(crate) fn read_only(path: &[String]) -> Self {
        Error::ReadOnlyViolation(path.join("/"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::read_only(&["settings".into(), "theme".into()]);
        assert_eq!(err.to_string(), "node is read-only: /settings/theme");

        let err = Error::ComputeFailed("division by zero".into());
        assert_eq!(
            err.to_string(),
            "computed evaluation failed: division by zero"
        );

        let err = Error::read_only(&[]);
        assert_eq!(err.to_string(), "node is read-only: /");
    }

    #[test]
    fn from_serde_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}

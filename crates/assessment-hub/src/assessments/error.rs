use serde::Serialize;

use super::directory::DirectoryError;
use super::store::StoreError;
use super::uploads::StorageError;

/// One failed precondition, addressed by the payload location it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error raised by the assessment service. Every variant aborts the enclosing transaction.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{}", summarize(.0))]
    Validation(Vec<Violation>),
    #[error("{0}")]
    Conflict(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![Violation::new(field, message)])
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Internal(_) => "internal_failure",
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            ServiceError::Validation(violations) => violations,
            _ => &[],
        }
    }
}

fn summarize(violations: &[Violation]) -> String {
    match violations {
        [] => "validation failed".to_string(),
        [only] => format!("{}: {}", only.field, only.message),
        [first, rest @ ..] => format!(
            "{}: {} (and {} more)",
            first.field,
            first.message,
            rest.len()
        ),
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::NotFound(what) => Self::NotFound(what),
        }
    }
}

impl From<DirectoryError> for ServiceError {
    fn from(value: DirectoryError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<StorageError> for ServiceError {
    fn from(value: StorageError) -> Self {
        Self::Internal(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_counts_remaining_violations() {
        let error = ServiceError::Validation(vec![
            Violation::new("items[0].title", "title must not be empty"),
            Violation::new("items[1].title", "title must not be empty"),
            Violation::new("items[2].title", "title must not be empty"),
        ]);
        assert_eq!(
            error.to_string(),
            "items[0].title: title must not be empty (and 2 more)"
        );
        assert_eq!(error.violations().len(), 3);
        assert_eq!(error.kind(), "validation_error");
    }

    #[test]
    fn store_errors_keep_their_category() {
        let conflict: ServiceError = StoreError::Conflict("duplicate".to_string()).into();
        assert!(matches!(conflict, ServiceError::Conflict(_)));

        let missing: ServiceError = StoreError::NotFound("indicator x".to_string()).into();
        assert_eq!(missing.to_string(), "indicator x not found");
    }
}

use thiserror::Error;
use uuid::Uuid;

/// Errors from repository operations (used by trait definitions in stepflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict(_))
    }
}

/// Errors from mutating an [`Attempt`](crate::job::Attempt).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("attempt {0} already stopped")]
    AlreadyStopped(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
        assert!(!err.is_conflict());
        assert!(RepositoryError::Conflict("revision 3".to_string()).is_conflict());
    }
}

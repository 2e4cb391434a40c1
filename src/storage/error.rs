use thiserror::Error;

/// Failure classes shared by every layer of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A precondition was violated by the caller
    InvalidArgument,
    /// A referenced row does not exist
    NotFound,
    /// A storage integrity rule was broken
    ConstraintViolation,
    /// Transient serialization or deadlock signal; worth retrying
    Conflict,
    /// Infrastructure failure (connection, commit, rollback)
    Unavailable,
    /// The caller's cancellation signal fired
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a ledger store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("transient conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// True for the transient conflict class, the only class the engine retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(StoreError::not_found("account", 4).kind(), ErrorKind::NotFound);
        assert_eq!(
            StoreError::ConstraintViolation("fk".into()).kind(),
            ErrorKind::ConstraintViolation
        );
        assert_eq!(StoreError::Conflict("busy".into()).kind(), ErrorKind::Conflict);
        assert_eq!(StoreError::Unavailable("io".into()).kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_only_conflict_is_conflict() {
        assert!(StoreError::Conflict("deadlock".into()).is_conflict());
        assert!(!StoreError::Unavailable("gone".into()).is_conflict());
        assert!(!StoreError::not_found("account", 1).is_conflict());
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(
            StoreError::not_found("account", 42).to_string(),
            "account 42 not found"
        );
    }
}

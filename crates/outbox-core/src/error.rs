//! Error types for outbox store operations.

use thiserror::Error;

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the durable message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// A state-transition update affected zero rows.
    ///
    /// Every state transition is a single-row conditional update that must
    /// report exactly one affected row; zero rows means the row vanished
    /// unexpectedly. This is an integrity violation, never a silent no-op.
    #[error("there is no deferred message stored in the outbox with id {0}")]
    MessageNotFound(i64),

    /// Constraint violation on insert or update.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_not_found_carries_id() {
        let err = StoreError::MessageNotFound(42);
        assert_eq!(
            err.to_string(),
            "there is no deferred message stored in the outbox with id 42"
        );
    }

    #[test]
    fn sqlx_row_not_found_maps_to_database_error() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}

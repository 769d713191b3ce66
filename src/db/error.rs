// Store error kinds — the loop branches on these.
//
// A Connection error means the session itself is unusable (can't open the
// database, pool timed out, tunnel down): the whole cycle is abandoned and
// retried after the normal sleep. A Record error belongs to one row
// (constraint violation, lock timeout on a single statement): that row is
// skipped and its siblings carry on.

use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the session/transaction could not
    /// be established.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A single statement failed; the session is still healthy.
    #[error("store record operation failed: {0}")]
    Record(String),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::CannotOpen
                        | ErrorCode::NotADatabase
                        | ErrorCode::DatabaseCorrupt
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::PermissionDenied
                ) =>
            {
                StoreError::Connection(err.to_string())
            }
            _ => StoreError::Record(err.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx_core::Error> for StoreError {
    fn from(err: sqlx_core::Error) -> Self {
        match &err {
            sqlx_core::Error::Io(_)
            | sqlx_core::Error::Tls(_)
            | sqlx_core::Error::PoolTimedOut
            | sqlx_core::Error::PoolClosed
            | sqlx_core::Error::WorkerCrashed
            | sqlx_core::Error::Configuration(_) => StoreError::Connection(err.to_string()),
            _ => StoreError::Record(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_kind() {
        assert!(StoreError::Connection("refused".into()).is_connection());
        assert!(!StoreError::Record("constraint".into()).is_connection());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_constraint_violation_is_record_error() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER CHECK (x >= 1));")
            .unwrap();
        let err = conn.execute("INSERT INTO t (x) VALUES (0)", []).unwrap_err();
        assert!(!StoreError::from(err).is_connection());
    }
}

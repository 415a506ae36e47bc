use common::{Classify, ErrorClass};
use thiserror::Error;

/// How a failed query is classified for surfacing and retry routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Unique/check constraint violation.
    Constraint,
    /// Lost or refused connection.
    Connection,
    /// SQLITE_BUSY / lock contention, retried internally first.
    Busy,
    Other,
}

impl std::fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryErrorKind::Constraint => "constraint",
            QueryErrorKind::Connection => "connection",
            QueryErrorKind::Busy => "busy",
            QueryErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("query failed ({kind}): {message} [sql: {sql}]")]
    Query {
        kind: QueryErrorKind,
        message: String,
        /// Truncated statement text for diagnosis.
        sql: String,
    },

    #[error("busy: retries exhausted after {attempts} attempts")]
    BusyExhausted { attempts: u32 },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} already exists: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("corrupt row in {entity}: {reason}")]
    CorruptRow { entity: &'static str, reason: String },

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("json column: {0}")]
    Json(#[from] serde_json::Error),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Query { kind, .. } => match kind {
                QueryErrorKind::Busy | QueryErrorKind::Connection => ErrorClass::Transient,
                QueryErrorKind::Constraint => ErrorClass::Validation,
                QueryErrorKind::Other => ErrorClass::Fatal,
            },
            StoreError::BusyExhausted { .. } => ErrorClass::Transient,
            StoreError::NotFound { .. } | StoreError::Duplicate { .. } => ErrorClass::Validation,
            StoreError::CorruptRow { .. } | StoreError::Migration(_) | StoreError::Json(_) => {
                ErrorClass::Fatal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SQL_TRUNCATE: usize = 120;

/// Map a sqlx failure onto the taxonomy, carrying the truncated SQL.
pub fn map_sqlx(err: sqlx::Error, sql: &str) -> StoreError {
    let kind = match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            if message.contains("locked") || message.contains("busy") {
                QueryErrorKind::Busy
            } else if db.is_unique_violation() || db.is_check_violation() || db.is_foreign_key_violation() {
                QueryErrorKind::Constraint
            } else {
                QueryErrorKind::Other
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            QueryErrorKind::Connection
        }
        _ => QueryErrorKind::Other,
    };
    StoreError::Query {
        kind,
        message: err.to_string(),
        sql: sql.chars().take(SQL_TRUNCATE).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let busy = StoreError::Query {
            kind: QueryErrorKind::Busy,
            message: "database is locked".into(),
            sql: "UPDATE folders".into(),
        };
        assert_eq!(busy.class(), ErrorClass::Transient);

        let dup = StoreError::Duplicate {
            entity: "folder",
            key: "/tmp/x".into(),
        };
        assert_eq!(dup.class(), ErrorClass::Validation);

        assert_eq!(
            StoreError::Migration("boom".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn sql_is_truncated_in_messages() {
        let long_sql = "SELECT ".repeat(100);
        let err = map_sqlx(sqlx::Error::PoolTimedOut, &long_sql);
        if let StoreError::Query { sql, kind, .. } = err {
            assert!(sql.len() <= SQL_TRUNCATE);
            assert_eq!(kind, QueryErrorKind::Connection);
        } else {
            panic!("expected query error");
        }
    }
}

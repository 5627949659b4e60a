//! # Database Error Types
//!
//! Error types for database operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds context and categorization                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  EngineError (meridian-engine) ← Categorized for retry decisions        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Rejection { code, category, message, retryable }                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Database operation errors.
///
/// These errors wrap sqlx errors and provide additional context
/// for debugging and for the engine's retry decisions.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    ///
    /// ## When This Occurs
    /// - `fetch_one` returns no rows
    /// - ID doesn't exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Settling the same quote twice (`orders.quote_id`)
    /// - Duplicate coupon code
    /// - Two writers appending the same ledger sequence
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// A conditional write matched no row because another writer got there
    /// first.
    ///
    /// ## When This Occurs
    /// - Stock compare-and-swap saw a different quantity
    /// - Order status changed underneath a transition
    #[error("Concurrent update on {entity} {id}")]
    Conflict { entity: String, id: String },

    /// Stored data violates an invariant the schema cannot express.
    ///
    /// ## When This Occurs
    /// - Unparseable JSON in a detail column
    /// - Unknown enum text
    #[error("Corrupted {entity} {id}: {reason}")]
    Corrupted {
        entity: String,
        id: String,
        reason: String,
    },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// SQLite kept the file locked past the busy timeout.
    ///
    /// ## When This Occurs
    /// - Another connection held the write lock for longer than
    ///   `busy_timeout`
    #[error("Database busy: {0}")]
    Busy(String),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn conflict(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::Conflict {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn corrupted(entity: impl Into<String>, id: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::Corrupted {
            entity: entity.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure came from contention rather than bad data.
    pub fn is_contention(&self) -> bool {
        matches!(self, DbError::Conflict { .. } | DbError::PoolExhausted | DbError::Busy(_))
    }

    /// Whether this is a UNIQUE violation on `column` (`table.column`).
    pub fn is_unique_violation_on(&self, column: &str) -> bool {
        matches!(self, DbError::UniqueViolation { field, .. } if field.contains(column))
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
///                               SQLITE_BUSY / SQLITE_LOCKED → DbError::Busy
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                // extended codes keep the primary code in the low byte
                let primary = db_err.code().and_then(|c| c.parse::<i32>().ok()).map(|c| c & 0xff);

                // SQLite constraint messages:
                // UNIQUE constraint: "UNIQUE constraint failed: <table>.<column>"
                // FK constraint: "FOREIGN KEY constraint failed"
                // Busy: "database is locked"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else if matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED)) || msg.contains("is locked") {
                    DbError::Busy(msg.to_string())
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Internal(format!("JSON: {}", err))
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

//! Error types for db-bridge.
//!
//! Every fallible operation returns [`DbResult`]. Variants carry the driver's
//! text verbatim plus, where one is known, a suggestion for the caller.
//! [`DbError::kind`] folds the variants onto the coarse taxonomy callers
//! branch on.

use serde::Serialize;
use thiserror::Error;

use crate::models::DatabaseType;

/// Coarse error class, stable across dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Query,
    Cancelled,
    PartialMutation,
    Internal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("SSH tunnel error: {message}")]
    Tunnel { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Permission denied: {operation} - {reason}")]
    Permission { operation: String, reason: String },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Changes rolled back during {stage}: {source}")]
    ChangesRolledBack {
        stage: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    #[error("Connection '{connection_id}' is still connecting")]
    StillConnecting { connection_id: String },

    #[error("Database '{database}' not found: {hint}")]
    DatabaseNotFound { database: String, hint: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Unsupported {operation} for {dialect}")]
    Unsupported { operation: String, dialect: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn tunnel(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Tunnel {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Wrap a failure that forced a change bundle to roll back.
    pub fn rolled_back(stage: impl Into<String>, source: DbError) -> Self {
        Self::ChangesRolledBack {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn connection_not_found(connection_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            connection_id: connection_id.into(),
        }
    }

    pub fn still_connecting(connection_id: impl Into<String>) -> Self {
        Self::StillConnecting {
            connection_id: connection_id.into(),
        }
    }

    pub fn database_not_found(database: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::DatabaseNotFound {
            database: database.into(),
            hint: hint.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, dialect: DatabaseType) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            dialect: dialect.display_name().to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Connection { .. }
            | Self::ConnectionLost { .. }
            | Self::Tunnel { .. }
            | Self::Timeout { .. }
            | Self::ConnectionNotFound { .. }
            | Self::StillConnecting { .. }
            | Self::DatabaseNotFound { .. } => ErrorKind::Connectivity,
            Self::Database { .. }
            | Self::Permission { .. }
            | Self::Schema { .. }
            | Self::InvalidInput { .. }
            | Self::Unsupported { .. } => ErrorKind::Query,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ChangesRolledBack { .. } => ErrorKind::PartialMutation,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. }
            | Self::Tunnel { suggestion, .. }
            | Self::Database { suggestion, .. } => Some(suggestion),
            Self::DatabaseNotFound { hint, .. } => Some(hint),
            Self::ChangesRolledBack { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// The session behind this error is unusable and must not go back to the pool.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } => true,
            // admin shutdown, crash shutdown, connection exceptions
            Self::Database {
                sql_state: Some(code),
                ..
            } => matches!(
                code.as_str(),
                "57P01" | "57P02" | "57P03" | "08000" | "08003" | "08006" | "08S01"
            ),
            _ => false,
        }
    }

    /// Raised by the server when a running statement was interrupted
    /// (PostgreSQL `57014`, MySQL `ER_QUERY_INTERRUPTED` / SQLSTATE `70100`).
    pub fn is_query_canceled(&self) -> bool {
        match self {
            Self::Database {
                sql_state: Some(code),
                ..
            } => matches!(code.as_str(), "57014" | "70100"),
            Self::Database { message, .. } => message.contains("Query execution was interrupted"),
            _ => false,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionLost { .. }
                | Self::Tunnel { .. }
                | Self::Timeout { .. }
                | Self::StillConnecting { .. }
        )
    }

    /// Attach a hint for driver gotchas that produce confusing raw errors.
    pub fn with_driver_hint(self, dialect: DatabaseType) -> Self {
        match self {
            Self::Database {
                message,
                sql_state,
                suggestion,
            } => {
                let lower = message.to_lowercase();
                let hint = match dialect {
                    DatabaseType::PostgreSQL
                        if lower.contains("cannot insert multiple commands into a prepared statement") =>
                    {
                        Some("The text holds several statements; run it through execute_query, which sends multi-statement text in one round trip")
                    }
                    DatabaseType::MySQL if lower.contains("delimiter") => Some(
                        "DELIMITER is a client-side command of the mysql shell; send the routine body as a single statement instead",
                    ),
                    DatabaseType::SQLite if lower.contains("database is locked") => Some(
                        "Another connection holds a write lock; retry after it commits or lower max_connections to 1",
                    ),
                    _ => None,
                };
                Self::Database {
                    message,
                    sql_state,
                    suggestion: hint.map(str::to_string).unwrap_or(suggestion),
                }
            }
            other => other,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout(
                "connection pool acquire",
                crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS as u32,
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection_lost(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => {
                DbError::connection_lost(format!("Protocol error: {}", msg))
            }
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection_lost("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<scylla::transport::errors::QueryError> for DbError {
    fn from(err: scylla::transport::errors::QueryError) -> Self {
        DbError::database(
            err.to_string(),
            None,
            "Check the CQL syntax, keyspace and consistency level",
        )
    }
}

impl From<scylla::transport::errors::NewSessionError> for DbError {
    fn from(err: scylla::transport::errors::NewSessionError) -> Self {
        DbError::connection(
            err.to_string(),
            "Check the contact points, credentials and that the native transport port is reachable",
        )
    }
}

impl From<russh::Error> for DbError {
    fn from(err: russh::Error) -> Self {
        DbError::tunnel(
            err.to_string(),
            "Check the bastion host, port and that it accepts the configured credentials",
        )
    }
}

impl From<russh_keys::Error> for DbError {
    fn from(err: russh_keys::Error) -> Self {
        DbError::tunnel(
            format!("Failed to load SSH key: {}", err),
            "Check the key path and passphrase",
        )
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

//! Error types for shardctl.

use thiserror::Error;

use crate::models::MigrationState;

/// Result type alias using shardctl's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for shard routing, migration and health operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A query failed in a store that is not backed by sqlx
    #[error("Query error: {0}")]
    Query(String),

    /// Opening a connection to a shard failed
    #[error("failed to open connection to shard {shard}: {source}")]
    ShardOpen {
        shard: usize,
        #[source]
        source: Box<Error>,
    },

    /// A freshly opened shard connection did not answer a ping
    #[error("failed to ping shard {shard}: {source}")]
    ShardPing {
        shard: usize,
        #[source]
        source: Box<Error>,
    },

    /// Shard number or id not present in the topology
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    /// A column could not be represented as a SqlValue
    #[error("Unsupported column type {type_name} for column {column}")]
    UnsupportedType { column: String, type_name: String },

    /// Source and target row counts differ after a copy
    #[error("table {table}: source has {source_count} records, target has {target_count} records")]
    VerificationMismatch {
        table: String,
        source_count: i64,
        target_count: i64,
    },

    /// Migration state machine violation
    #[error("Invalid migration transition from {from} to {to}")]
    InvalidTransition {
        from: MigrationState,
        to: MigrationState,
    },

    /// A migration is already running on this instance
    #[error("Migration already active")]
    MigrationActive,

    /// No migration is registered under this id
    #[error("Migration not found: {0}")]
    MigrationNotFound(String),

    /// A migration phase failed; wraps the underlying cause
    #[error("Migration failed during {phase} phase: {source}")]
    Phase {
        phase: MigrationState,
        #[source]
        source: Box<Error>,
    },

    /// Operation aborted by an operator
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an error with the migration phase it occurred in.
    ///
    /// Already-wrapped errors are returned unchanged.
    pub fn in_phase(self, phase: MigrationState) -> Self {
        match self {
            Error::Phase { .. } => self,
            other => Error::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error (or the error it wraps) is an operator cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Phase { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_shard_open() {
        let err = Error::ShardOpen {
            shard: 3,
            source: Box::new(Error::Query("connection refused".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "failed to open connection to shard 3: Query error: connection refused"
        );
    }

    #[test]
    fn test_error_display_shard_ping() {
        let err = Error::ShardPing {
            shard: 1,
            source: Box::new(Error::Timeout("ping".to_string())),
        };
        assert!(err.to_string().starts_with("failed to ping shard 1"));
    }

    #[test]
    fn test_error_display_verification_mismatch() {
        let err = Error::VerificationMismatch {
            table: "orders".to_string(),
            source_count: 100,
            target_count: 99,
        };
        assert_eq!(
            err.to_string(),
            "table orders: source has 100 records, target has 99 records"
        );
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            from: MigrationState::Completed,
            to: MigrationState::RolledBack,
        };
        assert_eq!(
            err.to_string(),
            "Invalid migration transition from completed to rolled_back"
        );
    }

    #[test]
    fn test_error_display_migration_not_found() {
        let err = Error::MigrationNotFound("migration_0_to_4_17".to_string());
        assert_eq!(err.to_string(), "Migration not found: migration_0_to_4_17");
    }

    #[test]
    fn test_in_phase_names_phase() {
        let err = Error::Query("boom".to_string()).in_phase(MigrationState::Verifying);
        assert_eq!(
            err.to_string(),
            "Migration failed during verifying phase: Query error: boom"
        );
    }

    #[test]
    fn test_in_phase_does_not_double_wrap() {
        let err = Error::Cancelled
            .in_phase(MigrationState::InProgress)
            .in_phase(MigrationState::Verifying);
        match err {
            Error::Phase { phase, .. } => assert_eq!(phase, MigrationState::InProgress),
            _ => panic!("Expected Phase error"),
        }
    }

    #[test]
    fn test_is_cancelled_through_phase() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::Cancelled
            .in_phase(MigrationState::InProgress)
            .is_cancelled());
        assert!(!Error::Internal("x".to_string()).is_cancelled());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("I/O error:"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}

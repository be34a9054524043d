//! Error types for reading and writing tables.

use crate::Version;

/// All the errors this crate can produce.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error with no finer-grained category.
    #[error("Delta table error: {0}")]
    Generic(String),

    /// An error from the arrow crate while building or slicing record batches.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// An error from the parquet crate while encoding data files.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// An error serializing or deserializing log JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A malformed URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The table location could not be resolved to an object store.
    #[error("Invalid table location: {0}")]
    InvalidTableLocation(String),

    /// The object store reported a failure that was not a simple not-found or
    /// already-exists condition.
    #[error("Object store error at {location}: {source}")]
    StoreUnavailable {
        /// Location of the object being accessed.
        location: String,
        /// Underlying store error.
        #[source]
        source: object_store::Error,
    },

    /// A required file does not exist.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The target of a conditional put already exists.
    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    /// A table was found where the caller asked to create one.
    #[error("Table already exists at {0}")]
    TableAlreadyExists(String),

    /// No transaction log was found at the table location.
    #[error("No table found at {0}")]
    TableNotFound(String),

    /// The table schema itself is invalid.
    #[error("Invalid schema: {0}")]
    Schema(String),

    /// Data offered for insert does not match the table schema.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The transaction log is readable but structurally invalid, for example
    /// a gap in the observed commit range.
    #[error("Corrupt transaction log at {location}: {message}")]
    LogCorrupt {
        /// Log location the corruption was observed at.
        location: String,
        /// What was wrong.
        message: String,
    },

    /// The table requires protocol features this crate does not implement.
    #[error(
        "Unsupported protocol: table requires reader version {min_reader_version} \
         and writer version {min_writer_version}"
    )]
    UnsupportedProtocol {
        /// Minimum reader version demanded by the table.
        min_reader_version: i32,
        /// Minimum writer version demanded by the table.
        min_writer_version: i32,
    },

    /// A commit lost its race and the conflicting history could not be
    /// reconciled, or the retry budget ran out.
    #[error("Concurrent write conflict at {location} on version {version}: {message}")]
    ConcurrentWriteConflict {
        /// Table location the conflict occurred at.
        location: String,
        /// The log version that was contended.
        version: Version,
        /// Why the commit could not be retried.
        message: String,
    },

    /// A checkpoint file or the `_last_checkpoint` hint could not be used.
    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Time travel asked for a version the log does not contain.
    #[error("Version {requested} does not exist, latest available version is {latest}")]
    VersionNotFound {
        /// The version the caller asked for.
        requested: Version,
        /// The newest version the log actually holds.
        latest: Version,
    },

    /// The owning [`Runtime`](crate::Runtime) has been shut down.
    #[error("Runtime has been shut down")]
    RuntimeShutdown,

    /// The operation is not supported by this crate.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    pub(crate) fn generic(message: impl ToString) -> Self {
        Self::Generic(message.to_string())
    }

    pub(crate) fn invalid_table_location(location: impl ToString) -> Self {
        Self::InvalidTableLocation(location.to_string())
    }

    pub(crate) fn schema(message: impl ToString) -> Self {
        Self::Schema(message.to_string())
    }

    pub(crate) fn schema_mismatch(message: impl ToString) -> Self {
        Self::SchemaMismatch(message.to_string())
    }

    pub(crate) fn corrupt_log(location: impl ToString, message: impl ToString) -> Self {
        Self::LogCorrupt {
            location: location.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid_checkpoint(message: impl ToString) -> Self {
        Self::InvalidCheckpoint(message.to_string())
    }

    pub(crate) fn unsupported(message: impl ToString) -> Self {
        Self::Unsupported(message.to_string())
    }
}

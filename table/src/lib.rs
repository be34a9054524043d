//! Transactional table storage on top of cloud object stores.
//!
//! A table is a directory of immutable parquet data files plus a `_delta_log/`
//! directory containing an ordered sequence of JSON commit files. Version `N`
//! of the table lives at `_delta_log/{N:020}.json`; reading the table means
//! replaying the log up to some version, and writing means atomically claiming
//! the next version number. All coordination happens through the object store
//! itself, so any number of independent writers can share a table without an
//! external lock service.
//!
//! The two entry points are [`Runtime`], which owns the object store clients
//! and background maintenance, and [`Table`], a handle bound to one table
//! location:
//!
//! ```no_run
//! # use delta_table::{DeltaResult, Runtime, Table, TableCreateOptions, InsertOptions};
//! # use delta_table::schema::{DataType, StructField, StructType};
//! # async fn example(batch: arrow::array::RecordBatch) -> DeltaResult<()> {
//! let runtime = Runtime::new()?;
//! let schema = StructType::try_new(vec![
//!     StructField::not_null("id", DataType::LONG),
//!     StructField::nullable("name", DataType::STRING),
//! ])?;
//! let mut table = Table::create(
//!     &runtime,
//!     "s3://bucket/events",
//!     TableCreateOptions::new(schema),
//! )
//! .await?;
//! let version = table.insert(&[batch], InsertOptions::default()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Commits use optimistic concurrency: a writer stages its data files, then
//! attempts a conditional put of the next commit file. Losing a race surfaces
//! as a retry against the winner's log tail, and only genuinely incompatible
//! histories fail with [`Error::ConcurrentWriteConflict`].

use url::Url;

pub mod actions;
mod checkpoint;
mod committer;
mod error;
mod log_segment;
mod path;
mod runtime;
pub mod schema;
mod snapshot;
mod storage;
mod table;
mod transaction;
pub(crate) mod utils;
mod writer;

pub use error::Error;
pub use runtime::{Runtime, RuntimeOptions};
pub use snapshot::Snapshot;
pub use table::{InsertOptions, SaveMode, Table, TableCreateOptions, TableLoadOptions};

/// A table version number. Version 0 is the commit that created the table.
pub type Version = u64;

/// Convenience alias for a `Result` with this crate's [`Error`] type.
pub type DeltaResult<T, E = Error> = std::result::Result<T, E>;

/// Metadata about a file in an object store, as observed by a listing or a
/// head request.
///
/// Field order matters: the derived ordering sorts by location first, which
/// matches the lexicographic listing order object stores guarantee.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileMeta {
    /// Fully qualified location of the file.
    pub location: Url,
    /// Last modified time in milliseconds since the unix epoch.
    pub last_modified: i64,
    /// Size of the file in bytes.
    pub size: u64,
}

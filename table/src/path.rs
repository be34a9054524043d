//! Names and locations of files inside the `_delta_log/` directory.

use url::Url;
use uuid::Uuid;

use crate::{DeltaResult, Error, FileMeta, Version};

const VERSION_LEN: usize = 20;
const MULTIPART_PART_LEN: usize = 10;

pub(crate) const LOG_DIR: &str = "_delta_log/";
pub(crate) const LAST_CHECKPOINT_FILE_NAME: &str = "_last_checkpoint";

/// The `_delta_log/` directory of one table, with helpers to name the files
/// inside it.
#[derive(Debug, Clone)]
pub(crate) struct LogRoot {
    table_root: Url,
    log_root: Url,
}

impl LogRoot {
    /// `table_root` must end in a slash so joins stay inside the table.
    pub(crate) fn new(table_root: &Url) -> DeltaResult<Self> {
        Ok(Self {
            table_root: table_root.clone(),
            log_root: table_root.join(LOG_DIR)?,
        })
    }

    pub(crate) fn url(&self) -> &Url {
        &self.log_root
    }

    pub(crate) fn table_root(&self) -> &Url {
        &self.table_root
    }

    /// Location of the commit file for a version.
    pub(crate) fn commit_path(&self, version: Version) -> DeltaResult<Url> {
        Ok(self.log_root.join(&format!("{version:020}.json"))?)
    }

    /// Location of the checkpoint file for a version.
    pub(crate) fn checkpoint_path(&self, version: Version) -> DeltaResult<Url> {
        Ok(self.log_root.join(&format!("{version:020}.checkpoint.json"))?)
    }

    /// Location of the checkpoint hint file.
    pub(crate) fn last_checkpoint_path(&self) -> DeltaResult<Url> {
        Ok(self.log_root.join(LAST_CHECKPOINT_FILE_NAME)?)
    }

    /// Smallest possible name of a log file for a version, used as a listing
    /// offset. Sorts immediately before `{version:020}.checkpoint.json`.
    pub(crate) fn version_prefix(&self, version: Version) -> DeltaResult<Url> {
        Ok(self.log_root.join(&format!("{version:020}"))?)
    }

    /// A unique scratch location for a commit staged before an atomic rename.
    /// The leading underscore keeps it invisible to log listings.
    pub(crate) fn temp_commit_path(&self) -> DeltaResult<Url> {
        Ok(self
            .log_root
            .join(&format!("_commit_{}.json.tmp", Uuid::new_v4()))?)
    }
}

/// What kind of log file a name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogPathFileType {
    /// A commit, `{version:020}.json`.
    Commit,
    /// A checkpoint we can read, `{version:020}.checkpoint.json`.
    Checkpoint,
    /// A parquet checkpoint written by another implementation. Recognized so
    /// listings can account for it, but never read.
    ParquetCheckpoint,
    /// A versioned file we do not recognize, for example a `.crc` file.
    Unknown,
}

/// A file inside `_delta_log/` whose name starts with a 20 digit version.
#[derive(Debug, Clone)]
pub(crate) struct ParsedLogPath {
    pub(crate) location: FileMeta,
    pub(crate) filename: String,
    pub(crate) version: Version,
    pub(crate) file_type: LogPathFileType,
}

impl ParsedLogPath {
    /// Parse a listed file. Returns `Ok(None)` for names that do not start
    /// with a version number, such as `_last_checkpoint` or staged commits.
    pub(crate) fn try_from(location: FileMeta) -> DeltaResult<Option<Self>> {
        let filename = location
            .location
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(|segment| segment.to_string())
            .ok_or_else(|| {
                Error::generic(format!("cannot parse log path {}", location.location))
            })?;
        let Some(version_part) = filename.get(..VERSION_LEN) else {
            return Ok(None);
        };
        if !version_part.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        let Ok(version) = version_part.parse::<Version>() else {
            // 20 digits can overflow u64
            return Ok(None);
        };

        let rest = &filename[VERSION_LEN..];
        let file_type = match rest.strip_prefix('.') {
            Some(suffix) => match suffix.split('.').collect::<Vec<_>>().as_slice() {
                ["json"] => LogPathFileType::Commit,
                ["checkpoint", "json"] => LogPathFileType::Checkpoint,
                ["checkpoint", "parquet"] => LogPathFileType::ParquetCheckpoint,
                ["checkpoint", middle, "parquet"] if Uuid::parse_str(middle).is_ok() => {
                    LogPathFileType::ParquetCheckpoint
                }
                ["checkpoint", part, total, "parquet"]
                    if is_multipart_index(part) && is_multipart_index(total) =>
                {
                    LogPathFileType::ParquetCheckpoint
                }
                _ => LogPathFileType::Unknown,
            },
            None => LogPathFileType::Unknown,
        };
        Ok(Some(Self {
            location,
            filename,
            version,
            file_type,
        }))
    }
}

fn is_multipart_index(part: &str) -> bool {
    part.len() == MULTIPART_PART_LEN && part.bytes().all(|b| b.is_ascii_digit())
}

//! Strategies for atomically claiming a commit file.
//!
//! Claiming version `N` means making `_delta_log/{N:020}.json` exist with
//! our content, failing if it already exists. Stores with conditional puts
//! do this in one request; stores without them stage the commit under a
//! hidden name and rely on an atomic rename-if-not-exists instead. The
//! strategy is chosen per table through the `commit_strategy` storage option.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;
use url::Url;

use crate::path::LogRoot;
use crate::storage::StorageClient;
use crate::{DeltaResult, Error, Version};

/// Storage option that selects the commit strategy for a table.
pub(crate) const COMMIT_STRATEGY_OPT: &str = "commit_strategy";

/// Identifies the commit file a committer must try to claim.
#[derive(Debug, Clone)]
pub(crate) struct CommitMetadata {
    log_root: LogRoot,
    commit_path: Url,
    version: Version,
}

impl CommitMetadata {
    pub(crate) fn new(log_root: &LogRoot, version: Version) -> DeltaResult<Self> {
        Ok(Self {
            log_root: log_root.clone(),
            commit_path: log_root.commit_path(version)?,
            version,
        })
    }

    pub(crate) fn commit_path(&self) -> &Url {
        &self.commit_path
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }
}

/// Outcome of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitResponse {
    /// The commit file was claimed and the table now has this version.
    Committed { version: Version },
    /// Another writer claimed this version first.
    Conflict { version: Version },
}

/// How a commit file gets claimed exactly once.
///
/// Of all writers racing for the same version, at most one may observe
/// [`CommitResponse::Committed`]; everyone else must observe `Conflict`, not
/// a spurious error.
#[async_trait]
pub(crate) trait Committer: Send + Sync + std::fmt::Debug {
    async fn commit(
        &self,
        storage: &StorageClient,
        data: Bytes,
        commit: &CommitMetadata,
    ) -> DeltaResult<CommitResponse>;
}

/// Claims a version with a single conditional put.
#[derive(Debug, Default)]
pub(crate) struct ConditionalPutCommitter;

#[async_trait]
impl Committer for ConditionalPutCommitter {
    async fn commit(
        &self,
        storage: &StorageClient,
        data: Bytes,
        commit: &CommitMetadata,
    ) -> DeltaResult<CommitResponse> {
        match storage.put_if_absent(&commit.commit_path, data).await {
            Ok(()) => Ok(CommitResponse::Committed {
                version: commit.version,
            }),
            Err(Error::FileAlreadyExists(_)) => Ok(CommitResponse::Conflict {
                version: commit.version,
            }),
            Err(e) => Err(e),
        }
    }
}

/// Stages the commit under a hidden temporary name, then renames it into
/// place with rename-if-not-exists. For stores whose renames are atomic but
/// whose puts cannot be conditional.
#[derive(Debug, Default)]
pub(crate) struct RenameCommitter;

#[async_trait]
impl Committer for RenameCommitter {
    async fn commit(
        &self,
        storage: &StorageClient,
        data: Bytes,
        commit: &CommitMetadata,
    ) -> DeltaResult<CommitResponse> {
        let staged = commit.log_root.temp_commit_path()?;
        storage.put(&staged, data).await?;
        let outcome = storage
            .rename_if_not_exists(&staged, &commit.commit_path)
            .await;
        match outcome {
            Ok(()) => Ok(CommitResponse::Committed {
                version: commit.version,
            }),
            Err(e) => {
                // the staged file was not consumed; clean it up best-effort
                if let Err(cleanup) = storage.delete(&staged).await {
                    warn!(staged = %staged, error = %cleanup, "failed to delete staged commit");
                }
                match e {
                    Error::FileAlreadyExists(_) => Ok(CommitResponse::Conflict {
                        version: commit.version,
                    }),
                    other => Err(other),
                }
            }
        }
    }
}

/// Resolve the committer named by the `commit_strategy` storage option.
pub(crate) fn committer_for_strategy(strategy: Option<&str>) -> DeltaResult<Arc<dyn Committer>> {
    match strategy {
        None | Some("put-if-absent") => Ok(Arc::new(ConditionalPutCommitter)),
        Some("rename") => Ok(Arc::new(RenameCommitter)),
        Some(other) => Err(Error::generic(format!(
            "unknown commit strategy \"{other}\", expected \"put-if-absent\" or \"rename\""
        ))),
    }
}

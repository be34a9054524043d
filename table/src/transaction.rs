//! The optimistic commit loop.
//!
//! A writer prepares its actions against a snapshot at some read version,
//! then tries to claim read version + 1. Losing the race is normal: the
//! writer reads the commits that won, checks they do not invalidate what it
//! is about to write, and retries at the next free version with backoff. Only
//! a genuinely incompatible history or an exhausted retry budget surfaces as
//! [`Error::ConcurrentWriteConflict`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::TryStreamExt;
use rand::Rng;
use tracing::{debug, warn};

use crate::actions::{encode_actions, Action, CommitInfo};
use crate::committer::{CommitMetadata, CommitResponse, Committer};
use crate::path::LogRoot;
use crate::snapshot::tail_commits_after;
use crate::storage::StorageClient;
use crate::table::SaveMode;
use crate::{DeltaResult, Error, Version};

pub(crate) const DEFAULT_MAX_COMMIT_RETRIES: u32 = 15;

/// One table write, ready to be committed at the next available version.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub(crate) log_root: LogRoot,
    /// Version the writer based its decisions on.
    pub(crate) read_version: Version,
    pub(crate) mode: SaveMode,
    /// Operation name recorded in the commit info.
    pub(crate) operation: String,
    pub(crate) operation_parameters: HashMap<String, serde_json::Value>,
    /// The data actions of this commit. Commit info is stamped separately on
    /// every attempt.
    pub(crate) actions: Vec<Action>,
    pub(crate) max_retries: u32,
}

impl Transaction {
    /// Run the commit loop until the write lands, a winner turns out to be
    /// incompatible, or the retry budget runs out.
    pub(crate) async fn commit(
        &self,
        storage: &StorageClient,
        committer: &dyn Committer,
    ) -> DeltaResult<Version> {
        let our_removes: HashSet<&str> = self
            .actions
            .iter()
            .filter_map(|action| match action {
                Action::Remove(remove) => Some(remove.path.as_str()),
                _ => None,
            })
            .collect();

        let mut version = self.read_version + 1;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                backoff(attempt).await;
            }
            // fresh commit info per attempt so the timestamp and transaction
            // id always describe the attempt that actually landed
            let commit_info =
                CommitInfo::for_operation(&self.operation, self.operation_parameters.clone())?;
            let mut lines = Vec::with_capacity(self.actions.len() + 1);
            lines.push(Action::CommitInfo(commit_info));
            lines.extend(self.actions.iter().cloned());
            let data = encode_actions(&lines)?;

            let commit = CommitMetadata::new(&self.log_root, version)?;
            match committer.commit(storage, data, &commit).await? {
                CommitResponse::Committed { version } => {
                    debug!(version, attempt, "commit succeeded");
                    return Ok(version);
                }
                CommitResponse::Conflict { version: contended } => {
                    let winners: Vec<(Version, Vec<Action>)> = tail_commits_after(
                        storage.clone(),
                        self.log_root.clone(),
                        contended - 1,
                    )
                    .try_collect()
                    .await?;
                    match winners.last() {
                        None => {
                            // the winning commit is not visible to reads yet;
                            // retry the same version after a pause
                            warn!(
                                version = contended,
                                "commit conflicted but the winner is not readable yet"
                            );
                        }
                        Some((last_winner, _)) => {
                            for (winner_version, winner_actions) in &winners {
                                self.ensure_no_conflict(
                                    *winner_version,
                                    winner_actions,
                                    &our_removes,
                                )?;
                            }
                            version = last_winner + 1;
                            warn!(
                                contended,
                                retry_version = version,
                                attempt = attempt + 1,
                                max_attempts = self.max_retries + 1,
                                "commit conflict, retrying against the new log tail"
                            );
                        }
                    }
                }
            }
        }
        Err(Error::ConcurrentWriteConflict {
            location: self.log_root.table_root().to_string(),
            version,
            message: format!("gave up after {} attempts", self.max_retries + 1),
        })
    }

    /// Decide whether a winning commit invalidates this write.
    ///
    /// Appends tolerate concurrent data changes; any metadata or protocol
    /// change, a concurrent removal of a file we also remove, and any data
    /// change under an overwrite are conflicts.
    fn ensure_no_conflict(
        &self,
        winner_version: Version,
        winner_actions: &[Action],
        our_removes: &HashSet<&str>,
    ) -> DeltaResult<()> {
        let overwrite = self.mode == SaveMode::Overwrite;
        for action in winner_actions {
            let reason = match action {
                Action::Metadata(_) => Some("table metadata changed concurrently".to_string()),
                Action::Protocol(_) => Some("table protocol changed concurrently".to_string()),
                Action::Remove(remove) if our_removes.contains(remove.path.as_str()) => Some(
                    format!("file {} was already removed by a concurrent commit", remove.path),
                ),
                Action::Add(_) | Action::Remove(_) if overwrite => {
                    Some("table data changed concurrently during an overwrite".to_string())
                }
                _ => None,
            };
            if let Some(message) = reason {
                return Err(Error::ConcurrentWriteConflict {
                    location: self.log_root.table_root().to_string(),
                    version: winner_version,
                    message,
                });
            }
        }
        Ok(())
    }
}

/// Exponential backoff with full jitter, capped well under two seconds.
async fn backoff(attempt: u32) {
    let base_ms = 20 * (1u64 << attempt.min(5));
    let jitter = rand::thread_rng().gen_range(0..base_ms);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
}

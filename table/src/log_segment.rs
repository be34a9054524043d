//! Discovery of the log files that back a snapshot.

use tracing::{debug, warn};

use crate::checkpoint;
use crate::path::{LogPathFileType, LogRoot, ParsedLogPath};
use crate::storage::StorageClient;
use crate::{DeltaResult, Error, Version};

/// The minimal set of log files that reconstructs one table version: at most
/// one checkpoint plus the contiguous run of commits after it.
#[derive(Debug, Clone)]
pub(crate) struct LogSegment {
    pub(crate) log_root: LogRoot,
    /// A checkpoint to seed replay from, if one at or before `end_version`
    /// was found in a format we can read.
    pub(crate) checkpoint_file: Option<ParsedLogPath>,
    /// Commit files after the checkpoint, sorted by version, ending at
    /// `end_version`.
    pub(crate) ascending_commit_files: Vec<ParsedLogPath>,
    pub(crate) end_version: Version,
}

impl LogSegment {
    /// Discover the segment for the requested version, or for the latest
    /// version when `target` is `None`.
    ///
    /// The `_last_checkpoint` hint bounds the listing when it is usable; a
    /// hint that turns out to be stale falls back to listing the whole log.
    pub(crate) async fn for_snapshot(
        storage: &StorageClient,
        log_root: LogRoot,
        target: Option<Version>,
    ) -> DeltaResult<Self> {
        let hint = checkpoint::try_read_hint(storage, &log_root).await;
        let listing_start = hint
            .map(|h| h.version)
            .filter(|v| target.is_none_or(|t| *v <= t));

        let (mut checkpoint_file, mut commits) =
            Self::list_log_files(storage, &log_root, listing_start, target).await?;
        if listing_start.is_some() && checkpoint_file.is_none() {
            warn!(
                log_root = %log_root.url(),
                "checkpoint hint points at a checkpoint that is missing or unreadable, listing the whole log"
            );
            (checkpoint_file, commits) =
                Self::list_log_files(storage, &log_root, None, target).await?;
        }

        let table_root = log_root.table_root().to_string();
        Self::try_new(log_root, checkpoint_file, commits, target)?
            .ok_or(Error::TableNotFound(table_root))
    }

    /// Discover the segment for the requested version using commits only.
    /// Used to recover when a checkpoint file cannot be read.
    pub(crate) async fn for_snapshot_without_checkpoints(
        storage: &StorageClient,
        log_root: LogRoot,
        target: Option<Version>,
    ) -> DeltaResult<Self> {
        let (_, commits) = Self::list_log_files(storage, &log_root, None, target).await?;
        let table_root = log_root.table_root().to_string();
        Self::try_new(log_root, None, commits, target)?.ok_or(Error::TableNotFound(table_root))
    }

    /// List the log directory starting at `start` (or the beginning) and
    /// classify what it holds: the newest readable checkpoint not past
    /// `target`, and the commit files after it.
    async fn list_log_files(
        storage: &StorageClient,
        log_root: &LogRoot,
        start: Option<Version>,
        target: Option<Version>,
    ) -> DeltaResult<(Option<ParsedLogPath>, Vec<ParsedLogPath>)> {
        let start_from = log_root.version_prefix(start.unwrap_or(0))?;
        let mut checkpoint_file: Option<ParsedLogPath> = None;
        let mut commits: Vec<ParsedLogPath> = Vec::new();
        for meta in storage.list_from(&start_from).await? {
            let Some(parsed) = ParsedLogPath::try_from(meta)? else {
                continue;
            };
            if target.is_some_and(|t| parsed.version > t) {
                // listings are ascending, nothing below target follows
                break;
            }
            match parsed.file_type {
                LogPathFileType::Commit => commits.push(parsed),
                LogPathFileType::Checkpoint => {
                    // ascending listing, so the last one seen is the newest
                    checkpoint_file = Some(parsed);
                }
                LogPathFileType::ParquetCheckpoint => {
                    debug!(file = %parsed.filename, "skipping checkpoint in a format we do not read");
                }
                LogPathFileType::Unknown => {
                    debug!(file = %parsed.filename, "skipping unrecognized file in the log directory");
                }
            }
        }
        Ok((checkpoint_file, commits))
    }

    /// Validate contiguity and build the segment. `Ok(None)` means the log
    /// holds no usable files at all.
    fn try_new(
        log_root: LogRoot,
        checkpoint_file: Option<ParsedLogPath>,
        mut commits: Vec<ParsedLogPath>,
        target: Option<Version>,
    ) -> DeltaResult<Option<Self>> {
        let checkpoint_version = checkpoint_file.as_ref().map(|c| c.version);
        if let Some(cp) = checkpoint_version {
            // the checkpoint supersedes everything at or before its version
            commits.retain(|c| c.version > cp);
        }
        let Some(end_version) = commits.last().map(|c| c.version).or(checkpoint_version) else {
            return Ok(None);
        };

        let expected_first = checkpoint_version.map_or(0, |v| v + 1);
        if let Some(first) = commits.first() {
            if first.version != expected_first {
                let message = match checkpoint_version {
                    Some(cp) => format!(
                        "missing commits between checkpoint version {cp} and commit version {}",
                        first.version
                    ),
                    None => format!("log starts at version {} instead of 0", first.version),
                };
                return Err(Error::corrupt_log(log_root.url(), message));
            }
        }
        if let Some(gap) = commits
            .windows(2)
            .find(|w| w[0].version + 1 != w[1].version)
        {
            return Err(Error::corrupt_log(
                log_root.url(),
                format!(
                    "missing commits between versions {} and {}",
                    gap[0].version, gap[1].version
                ),
            ));
        }

        // a shorter-than-requested tail is not tolerated for time travel
        if let Some(t) = target {
            if end_version < t {
                return Err(Error::VersionNotFound {
                    requested: t,
                    latest: end_version,
                });
            }
        }

        Ok(Some(Self {
            log_root,
            checkpoint_file,
            ascending_commit_files: commits,
            end_version,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use object_store::memory::InMemory;
    use url::Url;

    use super::*;

    struct Fixture {
        storage: StorageClient,
        log_root: LogRoot,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = StorageClient::new(Arc::new(InMemory::new()), "memory");
            let table_root = Url::parse("memory:///events/").unwrap();
            Self {
                storage,
                log_root: LogRoot::new(&table_root).unwrap(),
            }
        }

        async fn put_commit(&self, version: Version) {
            let url = self.log_root.commit_path(version).unwrap();
            self.storage
                .put(&url, Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }

        async fn put_checkpoint(&self, version: Version) {
            let url = self.log_root.checkpoint_path(version).unwrap();
            self.storage
                .put(&url, Bytes::from_static(b"{}"))
                .await
                .unwrap();
            let hint = format!(r#"{{"version":{version},"size":1}}"#);
            self.storage
                .put(
                    &self.log_root.last_checkpoint_path().unwrap(),
                    hint.into_bytes().into(),
                )
                .await
                .unwrap();
        }

        async fn put_raw(&self, name: &str, data: &'static [u8]) {
            let url = self.log_root.url().join(name).unwrap();
            self.storage
                .put(&url, Bytes::from_static(data))
                .await
                .unwrap();
        }

        async fn segment(&self, target: Option<Version>) -> DeltaResult<LogSegment> {
            LogSegment::for_snapshot(&self.storage, self.log_root.clone(), target).await
        }
    }

    fn commit_versions(segment: &LogSegment) -> Vec<Version> {
        segment
            .ascending_commit_files
            .iter()
            .map(|c| c.version)
            .collect()
    }

    #[tokio::test]
    async fn contiguous_log_without_checkpoint() {
        let fx = Fixture::new();
        for v in 0..3 {
            fx.put_commit(v).await;
        }
        let segment = fx.segment(None).await.unwrap();
        assert_eq!(segment.end_version, 2);
        assert!(segment.checkpoint_file.is_none());
        assert_eq!(commit_versions(&segment), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn honors_target_version() {
        let fx = Fixture::new();
        for v in 0..4 {
            fx.put_commit(v).await;
        }
        let segment = fx.segment(Some(1)).await.unwrap();
        assert_eq!(segment.end_version, 1);
        assert_eq!(commit_versions(&segment), vec![0, 1]);
    }

    #[tokio::test]
    async fn target_beyond_end_is_version_not_found() {
        let fx = Fixture::new();
        fx.put_commit(0).await;
        fx.put_commit(1).await;
        let err = fx.segment(Some(5)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::VersionNotFound {
                requested: 5,
                latest: 1
            }
        ));
    }

    #[tokio::test]
    async fn empty_log_is_table_not_found() {
        let fx = Fixture::new();
        let err = fx.segment(None).await.unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
    }

    #[tokio::test]
    async fn interior_gap_is_corrupt() {
        let fx = Fixture::new();
        for v in [0, 1, 3] {
            fx.put_commit(v).await;
        }
        let err = fx.segment(None).await.unwrap_err();
        assert!(
            matches!(err, Error::LogCorrupt { ref message, .. } if message.contains("between versions 1 and 3")),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn missing_version_zero_is_corrupt() {
        let fx = Fixture::new();
        fx.put_commit(1).await;
        fx.put_commit(2).await;
        let err = fx.segment(None).await.unwrap_err();
        assert!(
            matches!(err, Error::LogCorrupt { ref message, .. } if message.contains("starts at version 1")),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn checkpoint_bounds_the_segment() {
        let fx = Fixture::new();
        for v in 0..6 {
            fx.put_commit(v).await;
        }
        fx.put_checkpoint(3).await;
        let segment = fx.segment(None).await.unwrap();
        assert_eq!(segment.end_version, 5);
        assert_eq!(
            segment.checkpoint_file.as_ref().map(|c| c.version),
            Some(3)
        );
        assert_eq!(commit_versions(&segment), vec![4, 5]);
    }

    #[tokio::test]
    async fn checkpoint_past_target_is_ignored() {
        let fx = Fixture::new();
        for v in 0..6 {
            fx.put_commit(v).await;
        }
        fx.put_checkpoint(3).await;
        let segment = fx.segment(Some(2)).await.unwrap();
        assert_eq!(segment.end_version, 2);
        assert!(segment.checkpoint_file.is_none());
        assert_eq!(commit_versions(&segment), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn stale_hint_falls_back_to_full_listing() {
        let fx = Fixture::new();
        for v in 0..3 {
            fx.put_commit(v).await;
        }
        // hint names a checkpoint that was never written
        fx.put_raw("_last_checkpoint", br#"{"version":2,"size":1}"#)
            .await;
        let segment = fx.segment(None).await.unwrap();
        assert_eq!(segment.end_version, 2);
        assert!(segment.checkpoint_file.is_none());
        assert_eq!(commit_versions(&segment), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn garbage_hint_is_ignored() {
        let fx = Fixture::new();
        fx.put_commit(0).await;
        fx.put_raw("_last_checkpoint", b"not json").await;
        let segment = fx.segment(None).await.unwrap();
        assert_eq!(segment.end_version, 0);
    }

    #[tokio::test]
    async fn parquet_checkpoint_is_listed_but_not_used() {
        let fx = Fixture::new();
        for v in 0..3 {
            fx.put_commit(v).await;
        }
        fx.put_raw("00000000000000000001.checkpoint.parquet", b"PAR1")
            .await;
        fx.put_raw("_last_checkpoint", br#"{"version":1,"size":9}"#)
            .await;
        // the hinted listing only finds an unreadable checkpoint, so the
        // whole log gets listed and replay starts from version 0
        let segment = fx.segment(None).await.unwrap();
        assert_eq!(segment.end_version, 2);
        assert!(segment.checkpoint_file.is_none());
        assert_eq!(commit_versions(&segment), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn without_checkpoints_ignores_checkpoints() {
        let fx = Fixture::new();
        for v in 0..5 {
            fx.put_commit(v).await;
        }
        fx.put_checkpoint(3).await;
        let segment = LogSegment::for_snapshot_without_checkpoints(
            &fx.storage,
            fx.log_root.clone(),
            None,
        )
        .await
        .unwrap();
        assert!(segment.checkpoint_file.is_none());
        assert_eq!(commit_versions(&segment), vec![0, 1, 2, 3, 4]);
    }
}

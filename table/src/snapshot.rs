//! An immutable view of a table at one version, built by replaying the log.

use std::collections::HashMap;

use futures::stream::Stream;
use itertools::Itertools;
use tracing::{debug, warn};
use url::Url;

use crate::actions::{decode_actions, Action, Add, Metadata, Protocol};
use crate::log_segment::LogSegment;
use crate::path::LogRoot;
use crate::schema::StructType;
use crate::storage::StorageClient;
use crate::{DeltaResult, Error, Version};

/// The state of a table at a specific version: protocol, metadata and the
/// set of live data files.
///
/// Replay folds the log in commit order. Within one commit, removes apply
/// before adds, so a commit may replace a file at a path it also removes.
/// Later metadata and protocol actions wholly replace earlier ones.
#[derive(Debug, Clone)]
pub struct Snapshot {
    table_root: Url,
    log_segment: LogSegment,
    protocol: Protocol,
    metadata: Metadata,
    schema: StructType,
    files: Vec<Add>,
}

impl Snapshot {
    /// Replay the log at `table_root` up to `version`, or to the latest
    /// version when `None`.
    pub(crate) async fn load(
        storage: &StorageClient,
        table_root: Url,
        version: Option<Version>,
    ) -> DeltaResult<Self> {
        let log_root = LogRoot::new(&table_root)?;
        let segment = LogSegment::for_snapshot(storage, log_root.clone(), version).await?;

        let checkpoint_actions = match &segment.checkpoint_file {
            Some(checkpoint) => {
                match read_log_file(storage, &checkpoint.location.location).await {
                    Ok(actions) => Some(actions),
                    Err(e) => {
                        // an unreadable checkpoint degrades to a full replay
                        warn!(
                            file = %checkpoint.filename,
                            error = %e,
                            "checkpoint is unreadable, replaying the full log"
                        );
                        let checkpoint_version = checkpoint.version;
                        let fallback = LogSegment::for_snapshot_without_checkpoints(
                            storage,
                            log_root.clone(),
                            version,
                        )
                        .await
                        .map_err(|fallback_err| {
                            Error::invalid_checkpoint(format!(
                                "checkpoint at version {checkpoint_version} is unreadable ({e}) \
                                 and the log cannot be replayed without it: {fallback_err}"
                            ))
                        })?;
                        return Self::replay(storage, table_root, fallback, None).await;
                    }
                }
            }
            None => None,
        };
        Self::replay(storage, table_root, segment, checkpoint_actions).await
    }

    async fn replay(
        storage: &StorageClient,
        table_root: Url,
        segment: LogSegment,
        checkpoint_actions: Option<Vec<Action>>,
    ) -> DeltaResult<Self> {
        let mut replay = LogReplay::default();
        if let Some(actions) = checkpoint_actions {
            replay.apply(&actions);
        }
        for commit in &segment.ascending_commit_files {
            let actions = read_log_file(storage, &commit.location.location).await?;
            replay.apply(&actions);
        }

        let protocol = replay.protocol.ok_or_else(|| {
            Error::corrupt_log(segment.log_root.url(), "no protocol action in the log")
        })?;
        protocol.ensure_read_supported()?;
        let metadata = replay.metadata.ok_or_else(|| {
            Error::corrupt_log(segment.log_root.url(), "no metadata action in the log")
        })?;
        let schema = metadata.parse_schema()?;
        let files: Vec<Add> = replay
            .files
            .into_values()
            .sorted_by(|a, b| a.path.cmp(&b.path))
            .collect();
        debug!(
            version = segment.end_version,
            files = files.len(),
            "loaded table snapshot"
        );
        Ok(Self {
            table_root,
            log_segment: segment,
            protocol,
            metadata,
            schema,
            files,
        })
    }

    /// The version this snapshot reflects.
    pub fn version(&self) -> Version {
        self.log_segment.end_version
    }

    /// Root location of the table.
    pub fn table_root(&self) -> &Url {
        &self.table_root
    }

    /// The table protocol in effect at this version.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// The table metadata in effect at this version.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The table schema in effect at this version.
    pub fn schema(&self) -> &StructType {
        &self.schema
    }

    /// Columns the table is partitioned by.
    pub fn partition_columns(&self) -> &[String] {
        &self.metadata.partition_columns
    }

    /// The live data files at this version, sorted by path.
    pub fn files(&self) -> &[Add] {
        &self.files
    }

    pub(crate) fn log_root(&self) -> &LogRoot {
        &self.log_segment.log_root
    }

    pub(crate) fn checkpoint_interval(&self) -> u64 {
        self.metadata.checkpoint_interval()
    }
}

/// Replay state. Last metadata and protocol win; the file set is keyed by
/// path with removes shadowing earlier adds.
#[derive(Debug, Default)]
struct LogReplay {
    protocol: Option<Protocol>,
    metadata: Option<Metadata>,
    files: HashMap<String, Add>,
}

impl LogReplay {
    fn apply(&mut self, actions: &[Action]) {
        for action in actions {
            if let Action::Remove(remove) = action {
                self.files.remove(&remove.path);
            }
        }
        for action in actions {
            match action {
                Action::Add(add) => {
                    self.files.insert(add.path.clone(), add.clone());
                }
                Action::Metadata(metadata) => self.metadata = Some(metadata.clone()),
                Action::Protocol(protocol) => self.protocol = Some(protocol.clone()),
                Action::Remove(_)
                | Action::CommitInfo(_)
                | Action::Txn(_)
                | Action::Cdc(_)
                | Action::DomainMetadata(_) => {}
            }
        }
    }
}

async fn read_log_file(storage: &StorageClient, url: &Url) -> DeltaResult<Vec<Action>> {
    let data = storage.get(url).await?;
    decode_actions(&data, url)
}

/// Stream the commits after `since` in version order, stopping at the first
/// version that does not exist yet.
pub(crate) fn tail_commits_after(
    storage: StorageClient,
    log_root: LogRoot,
    since: Version,
) -> impl Stream<Item = DeltaResult<(Version, Vec<Action>)>> {
    futures::stream::try_unfold(since + 1, move |version| {
        let storage = storage.clone();
        let log_root = log_root.clone();
        async move {
            let url = log_root.commit_path(version)?;
            match storage.get_opt(&url).await? {
                Some(data) => {
                    let actions = decode_actions(&data, &url)?;
                    Ok(Some(((version, actions), version + 1)))
                }
                None => Ok(None),
            }
        }
    })
}

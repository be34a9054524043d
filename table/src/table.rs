//! Table handles: creating, loading, writing and inspecting tables.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::RecordBatch;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::actions::{decode_actions, encode_actions, Action, Add, CommitInfo, Metadata, Protocol};
use crate::checkpoint;
use crate::committer::{self, CommitMetadata, CommitResponse, Committer};
use crate::path::LogRoot;
use crate::schema::StructType;
use crate::snapshot::Snapshot;
use crate::storage::StorageClient;
use crate::transaction::Transaction;
use crate::utils::{current_time_ms, require};
use crate::{DeltaResult, Error, Runtime, Version};

/// What an insert does about data already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Add the new data to whatever is already there.
    #[default]
    Append,
    /// Replace the current contents of the table with the new data.
    Overwrite,
    /// Fail with [`Error::TableAlreadyExists`] when the table holds data.
    ErrorIfExists,
    /// Do nothing and keep the current version when the table holds data.
    Ignore,
}

/// Options for [`Table::create`].
#[derive(Debug, Clone)]
pub struct TableCreateOptions {
    schema: StructType,
    partition_columns: Vec<String>,
    configuration: HashMap<String, String>,
    name: Option<String>,
    description: Option<String>,
    storage_options: HashMap<String, String>,
}

impl TableCreateOptions {
    /// Create options for a table with the given schema.
    pub fn new(schema: StructType) -> Self {
        Self {
            schema,
            partition_columns: Vec::new(),
            configuration: HashMap::new(),
            name: None,
            description: None,
            storage_options: HashMap::new(),
        }
    }

    /// Partition the table by the given columns, in order.
    pub fn with_partition_columns(
        mut self,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.partition_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set table properties, such as `delta.checkpointInterval`.
    pub fn with_configuration(
        mut self,
        configuration: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.configuration = configuration
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Set a user-facing table name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set a free-form table description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Options handed to the object store client, plus the keys this crate
    /// interprets itself such as `commit_strategy`.
    pub fn with_storage_options(
        mut self,
        options: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.storage_options = options
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }
}

/// Options for [`Table::load`].
#[derive(Debug, Clone, Default)]
pub struct TableLoadOptions {
    version: Option<Version>,
    storage_options: HashMap<String, String>,
}

impl TableLoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the table as of an historical version instead of the latest.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// See [`TableCreateOptions::with_storage_options`].
    pub fn with_storage_options(
        mut self,
        options: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.storage_options = options
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }
}

/// Options for [`Table::insert`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    save_mode: SaveMode,
}

impl InsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }
}

/// A handle to one table at one location.
///
/// A handle carries a snapshot of the table, refreshed after every
/// successful write through the handle. Handles never talk to each other;
/// two handles on the same table, in the same process or not, coordinate
/// purely through the log.
#[derive(Debug)]
pub struct Table {
    runtime: Runtime,
    table_root: Url,
    storage: StorageClient,
    committer: Arc<dyn Committer>,
    snapshot: Snapshot,
}

impl Table {
    /// Create a new table at `location` and return a handle at version 0.
    ///
    /// Creation commits protocol and metadata only; data arrives through
    /// [`Table::insert`]. Racing creators are serialized by the commit
    /// protocol and all but one fail with [`Error::TableAlreadyExists`].
    pub async fn create(
        runtime: &Runtime,
        location: impl AsRef<str>,
        options: TableCreateOptions,
    ) -> DeltaResult<Self> {
        runtime.ensure_open()?;
        let table_root = resolve_table_url(location.as_ref())?;
        let (storage_options, strategy) = split_storage_options(options.storage_options);
        let storage = runtime.store_for(&table_root, &storage_options)?;
        let committer = committer::committer_for_strategy(strategy.as_deref())?;
        let log_root = LogRoot::new(&table_root)?;

        let metadata = Metadata::try_new(
            &options.schema,
            options.partition_columns,
            options.configuration,
            options.name,
            options.description,
        )?;
        let commit_info = CommitInfo::for_operation(
            "CREATE TABLE",
            HashMap::from([
                (
                    "partitionBy".to_string(),
                    json!(serde_json::to_string(&metadata.partition_columns)?),
                ),
                (
                    "properties".to_string(),
                    json!(serde_json::to_string(&metadata.configuration)?),
                ),
            ]),
        )?;
        let actions = vec![
            Action::CommitInfo(commit_info),
            Action::Protocol(Protocol::supported()),
            Action::Metadata(metadata),
        ];
        let data = encode_actions(&actions)?;
        let commit = CommitMetadata::new(&log_root, 0)?;
        match committer.commit(&storage, data, &commit).await? {
            CommitResponse::Committed { .. } => {}
            CommitResponse::Conflict { .. } => {
                return Err(Error::TableAlreadyExists(table_root.to_string()));
            }
        }
        debug!(table = %table_root, "created table");

        let snapshot = Snapshot::load(&storage, table_root.clone(), None).await?;
        Ok(Self {
            runtime: runtime.clone(),
            table_root,
            storage,
            committer,
            snapshot,
        })
    }

    /// Open an existing table at its latest version, or at the version in
    /// `options` for time travel.
    pub async fn load(
        runtime: &Runtime,
        location: impl AsRef<str>,
        options: TableLoadOptions,
    ) -> DeltaResult<Self> {
        runtime.ensure_open()?;
        let table_root = resolve_table_url(location.as_ref())?;
        let (storage_options, strategy) = split_storage_options(options.storage_options);
        let storage = runtime.store_for(&table_root, &storage_options)?;
        let committer = committer::committer_for_strategy(strategy.as_deref())?;
        let snapshot = Snapshot::load(&storage, table_root.clone(), options.version).await?;
        Ok(Self {
            runtime: runtime.clone(),
            table_root,
            storage,
            committer,
            snapshot,
        })
    }

    /// Insert record batches and return the version the write landed at.
    ///
    /// The save mode decides what happens when the table already holds data;
    /// see [`SaveMode`]. Empty input changes nothing and returns the current
    /// version. Cancelling the returned future may leave data files behind,
    /// but never a partial commit.
    pub async fn insert(
        &mut self,
        batches: &[RecordBatch],
        options: InsertOptions,
    ) -> DeltaResult<Version> {
        self.runtime.ensure_open()?;
        self.snapshot.protocol().ensure_write_supported()?;

        let has_data = !self.snapshot.files().is_empty();
        match options.save_mode {
            SaveMode::Ignore if has_data => {
                debug!("table already holds data and save mode is Ignore, nothing to do");
                return Ok(self.version());
            }
            SaveMode::ErrorIfExists if has_data => {
                return Err(Error::TableAlreadyExists(self.table_root.to_string()));
            }
            _ => {}
        }

        let adds = crate::writer::write_data_files(
            &self.storage,
            &self.table_root,
            self.snapshot.schema(),
            self.snapshot.partition_columns(),
            batches,
            self.runtime.options().io_concurrency,
        )
        .await?;
        if adds.is_empty() {
            return Ok(self.version());
        }

        let mut actions = Vec::with_capacity(adds.len() + self.snapshot.files().len());
        if options.save_mode == SaveMode::Overwrite {
            let deletion_timestamp = current_time_ms()?;
            actions.extend(
                self.snapshot
                    .files()
                    .iter()
                    .map(|file| Action::Remove(file.to_remove(deletion_timestamp))),
            );
        }
        actions.extend(adds.into_iter().map(Action::Add));

        let transaction = Transaction {
            log_root: LogRoot::new(&self.table_root)?,
            read_version: self.version(),
            mode: options.save_mode,
            operation: "WRITE".to_string(),
            operation_parameters: HashMap::from([
                ("mode".to_string(), json!(format!("{:?}", options.save_mode))),
                (
                    "partitionBy".to_string(),
                    json!(serde_json::to_string(self.snapshot.partition_columns())?),
                ),
            ]),
            actions,
            max_retries: self.runtime.options().max_commit_retries,
        };
        let version = transaction
            .commit(&self.storage, self.committer.as_ref())
            .await?;

        self.refresh().await?;
        self.maybe_checkpoint();
        Ok(version)
    }

    /// Reload the handle's snapshot to the latest version.
    pub async fn refresh(&mut self) -> DeltaResult<Version> {
        self.runtime.ensure_open()?;
        self.snapshot = Snapshot::load(&self.storage, self.table_root.clone(), None).await?;
        Ok(self.version())
    }

    /// Write a checkpoint of the current snapshot right away.
    pub async fn checkpoint(&self) -> DeltaResult<Version> {
        self.runtime.ensure_open()?;
        checkpoint::write_checkpoint(&self.storage, &self.snapshot).await
    }

    /// The commit info of recent commits, newest first, at most `limit`
    /// entries (all of them when `None`).
    pub async fn history(&self, limit: Option<usize>) -> DeltaResult<Vec<(Version, CommitInfo)>> {
        self.runtime.ensure_open()?;
        let log_root = LogRoot::new(&self.table_root)?;
        let mut entries = Vec::new();
        let take = limit.unwrap_or(usize::MAX);
        for version in (0..=self.version()).rev() {
            if entries.len() >= take {
                break;
            }
            let url = log_root.commit_path(version)?;
            let Some(data) = self.storage.get_opt(&url).await? else {
                // commits below a checkpoint may have been cleaned up by
                // another implementation; history simply ends there
                debug!(version, "commit file missing, stopping the history walk");
                break;
            };
            let info = decode_actions(&data, &url)?
                .into_iter()
                .find_map(|action| match action {
                    Action::CommitInfo(info) => Some(info),
                    _ => None,
                })
                .unwrap_or_default();
            entries.push((version, info));
        }
        Ok(entries)
    }

    /// Queue a background checkpoint when the snapshot version is a multiple
    /// of the configured interval.
    fn maybe_checkpoint(&self) {
        if !self.runtime.options().background_checkpoints {
            return;
        }
        let interval = self.snapshot.checkpoint_interval();
        if !checkpoint::checkpoint_due(interval, self.snapshot.version()) {
            return;
        }
        let storage = self.storage.clone();
        let snapshot = self.snapshot.clone();
        self.runtime.spawn_maintenance(
            async move {
                if let Err(e) = checkpoint::write_checkpoint(&storage, &snapshot).await {
                    warn!(version = snapshot.version(), error = %e, "background checkpoint failed");
                }
            }
            .boxed(),
        );
    }

    /// The version of the snapshot this handle currently sees.
    pub fn version(&self) -> Version {
        self.snapshot.version()
    }

    /// Root location of the table.
    pub fn location(&self) -> &Url {
        &self.table_root
    }

    /// The snapshot this handle currently sees.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The table schema.
    pub fn schema(&self) -> &StructType {
        self.snapshot.schema()
    }

    /// The table metadata.
    pub fn metadata(&self) -> &Metadata {
        self.snapshot.metadata()
    }

    /// Columns the table is partitioned by.
    pub fn partition_columns(&self) -> &[String] {
        self.snapshot.partition_columns()
    }

    /// The live data files of the current snapshot.
    pub fn files(&self) -> &[Add] {
        self.snapshot.files()
    }
}

/// Normalize a table location into a directory URL. Bare paths become
/// `file://` URLs rooted at the current directory.
fn resolve_table_url(location: &str) -> DeltaResult<Url> {
    let location = location.trim();
    require!(
        !location.is_empty(),
        Error::invalid_table_location("empty table location")
    );
    let mut url = match Url::parse(location) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = std::path::absolute(location)
                .map_err(|e| Error::invalid_table_location(format!("{location}: {e}")))?;
            Url::from_directory_path(&path)
                .map_err(|()| Error::invalid_table_location(location))?
        }
        Err(e) => return Err(Error::invalid_table_location(format!("{location}: {e}"))),
    };
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url)
}

/// Split the caller's storage options into what goes to the object store
/// client and the keys this crate consumes itself.
fn split_storage_options(
    mut options: HashMap<String, String>,
) -> (HashMap<String, String>, Option<String>) {
    let strategy = options.remove(committer::COMMIT_STRATEGY_OPT);
    (options, strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_normalized_to_directories() {
        let url = resolve_table_url("s3://bucket/path/events").unwrap();
        assert_eq!(url.as_str(), "s3://bucket/path/events/");
        let url = resolve_table_url("memory:///events/").unwrap();
        assert_eq!(url.as_str(), "memory:///events/");
    }

    #[test]
    fn bare_paths_become_file_urls() {
        let url = resolve_table_url("some/events").unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/some/events/"));
    }

    #[test]
    fn empty_location_is_invalid() {
        assert!(matches!(
            resolve_table_url("   "),
            Err(Error::InvalidTableLocation(_))
        ));
    }

    #[test]
    fn commit_strategy_is_not_passed_to_the_store() {
        let (store_options, strategy) = split_storage_options(HashMap::from([
            ("commit_strategy".to_string(), "rename".to_string()),
            ("region".to_string(), "eu-north-1".to_string()),
        ]));
        assert_eq!(strategy.as_deref(), Some("rename"));
        assert_eq!(store_options.len(), 1);
        assert!(store_options.contains_key("region"));
    }
}

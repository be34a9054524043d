//! Checkpoints summarize the log so readers need not replay every commit.
//!
//! A checkpoint for version `N` lives at `_delta_log/{N:020}.checkpoint.json`
//! and holds the fully folded state of the table at `N` in the same
//! newline-delimited action encoding as commit files. The `_last_checkpoint`
//! object points readers at the newest one; it is only a hint, and anything
//! wrong with it degrades to listing the whole log.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actions::{encode_actions, Action};
use crate::path::LogRoot;
use crate::snapshot::Snapshot;
use crate::storage::StorageClient;
use crate::{DeltaResult, Version};

/// Contents of the `_last_checkpoint` hint object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastCheckpointHint {
    /// Version of the checkpointed snapshot.
    pub(crate) version: Version,
    /// Number of actions in the checkpoint file.
    pub(crate) size: u64,
    /// Part count of multi-part checkpoints written by other
    /// implementations. Checkpoints we write are always single files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) parts: Option<u64>,
}

/// Read the checkpoint hint if one exists. A missing or malformed hint is
/// never an error, merely a slower listing.
pub(crate) async fn try_read_hint(
    storage: &StorageClient,
    log_root: &LogRoot,
) -> Option<LastCheckpointHint> {
    let url = log_root.last_checkpoint_path().ok()?;
    match storage.get_opt(&url).await {
        Ok(Some(data)) => match serde_json::from_slice(&data) {
            Ok(hint) => Some(hint),
            Err(e) => {
                warn!(%url, error = %e, "ignoring unparseable checkpoint hint");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(%url, error = %e, "failed to read checkpoint hint");
            None
        }
    }
}

/// Write a checkpoint of the given snapshot and repoint `_last_checkpoint`
/// at it.
///
/// Both writes are plain puts. A checkpoint is a pure function of the
/// immutable log prefix it covers, so writers racing on the same version
/// produce identical files.
pub(crate) async fn write_checkpoint(
    storage: &StorageClient,
    snapshot: &Snapshot,
) -> DeltaResult<Version> {
    let version = snapshot.version();
    let mut actions: Vec<Action> = Vec::with_capacity(snapshot.files().len() + 2);
    actions.push(Action::Protocol(snapshot.protocol().clone()));
    actions.push(Action::Metadata(snapshot.metadata().clone()));
    actions.extend(snapshot.files().iter().map(|add| {
        let mut add = add.clone();
        // checkpointed files never announce a data change
        add.data_change = false;
        Action::Add(add)
    }));

    let data = encode_actions(&actions)?;
    let checkpoint_url = snapshot.log_root().checkpoint_path(version)?;
    storage.put(&checkpoint_url, data).await?;

    let hint = LastCheckpointHint {
        version,
        size: actions.len() as u64,
        parts: None,
    };
    let hint_url = snapshot.log_root().last_checkpoint_path()?;
    storage.put(&hint_url, serde_json::to_vec(&hint)?.into()).await?;
    debug!(version, actions = actions.len(), "wrote checkpoint");
    Ok(version)
}

/// Whether a freshly committed version is one a checkpoint is due at.
pub(crate) fn checkpoint_due(interval: u64, version: Version) -> bool {
    version > 0 && version % interval == 0
}

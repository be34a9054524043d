//! Thin wrapper over [`object_store`] clients working in terms of URLs.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::StreamExt;
use itertools::Itertools;
use object_store::path::Path;
use object_store::{DynObjectStore, ObjectMeta, PutMode};
use url::Url;

use crate::{DeltaResult, Error, FileMeta};

/// One table's view of its object store. Cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct StorageClient {
    store: Arc<DynObjectStore>,
    /// Object stores list in lexicographic order, except the local
    /// filesystem. Unordered listings get sorted after collection.
    has_ordered_listing: bool,
}

impl StorageClient {
    pub(crate) fn new(store: Arc<DynObjectStore>, scheme: &str) -> Self {
        Self {
            store,
            has_ordered_listing: scheme != "file",
        }
    }

    /// Read an object in full.
    pub(crate) async fn get(&self, url: &Url) -> DeltaResult<Bytes> {
        let path = to_store_path(url)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| map_store_err(url, e))?;
        result.bytes().await.map_err(|e| map_store_err(url, e))
    }

    /// Read an object in full, returning `None` if it does not exist.
    pub(crate) async fn get_opt(&self, url: &Url) -> DeltaResult<Option<Bytes>> {
        match self.get(url).await {
            Ok(data) => Ok(Some(data)),
            Err(Error::FileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch the metadata of an object.
    pub(crate) async fn head(&self, url: &Url) -> DeltaResult<FileMeta> {
        let path = to_store_path(url)?;
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|e| map_store_err(url, e))?;
        Ok(FileMeta {
            location: url.clone(),
            last_modified: meta.last_modified.timestamp_millis(),
            size: meta.size,
        })
    }

    /// Write an object, replacing any existing object at the location.
    pub(crate) async fn put(&self, url: &Url, data: Bytes) -> DeltaResult<()> {
        let path = to_store_path(url)?;
        self.store
            .put(&path, data.into())
            .await
            .map_err(|e| map_store_err(url, e))?;
        Ok(())
    }

    /// Write an object only if nothing exists at the location yet. Fails with
    /// [`Error::FileAlreadyExists`] when something does.
    pub(crate) async fn put_if_absent(&self, url: &Url, data: Bytes) -> DeltaResult<()> {
        let path = to_store_path(url)?;
        self.store
            .put_opts(&path, data.into(), PutMode::Create.into())
            .await
            .map_err(|e| map_store_err(url, e))?;
        Ok(())
    }

    /// Move an object only if nothing exists at the destination yet. Fails
    /// with [`Error::FileAlreadyExists`] when something does.
    pub(crate) async fn rename_if_not_exists(&self, from: &Url, to: &Url) -> DeltaResult<()> {
        let from_path = to_store_path(from)?;
        let to_path = to_store_path(to)?;
        self.store
            .rename_if_not_exists(&from_path, &to_path)
            .await
            .map_err(|e| map_store_err(to, e))?;
        Ok(())
    }

    /// Delete an object. Deleting an object that does not exist is not an
    /// error.
    pub(crate) async fn delete(&self, url: &Url) -> DeltaResult<()> {
        let path = to_store_path(url)?;
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_err(url, e)),
        }
    }

    /// List the parent directory of `url`, returning only objects whose
    /// location sorts strictly after `url`, in ascending lexicographic order.
    pub(crate) async fn list_from(&self, url: &Url) -> DeltaResult<Vec<FileMeta>> {
        let offset = to_store_path(url)?;
        let prefix = if url.path().ends_with('/') {
            offset.clone()
        } else {
            let mut parts = offset.parts().collect_vec();
            parts.pop();
            Path::from_iter(parts)
        };

        let mut stream = self.store.list_with_offset(Some(&prefix), &offset);
        let mut files = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| map_store_err(url, e))?;
            files.push(listed_file_meta(url, &meta));
        }
        if !self.has_ordered_listing {
            // local filesystem listings are in no particular order
            files.sort_unstable();
        }
        Ok(files)
    }
}

/// Convert a URL into the store-relative [`Path`] the client expects.
fn to_store_path(url: &Url) -> DeltaResult<Path> {
    Path::from_url_path(url.path())
        .map_err(|e| Error::invalid_table_location(format!("{url}: {e}")))
}

/// Rebuild a fully qualified URL for a listed object by swapping the path
/// into the URL the listing was issued against.
fn listed_file_meta(base: &Url, meta: &ObjectMeta) -> FileMeta {
    let mut location = base.clone();
    location.set_path(&format!("/{}", meta.location.as_ref()));
    FileMeta {
        location,
        last_modified: meta.last_modified.timestamp_millis(),
        size: meta.size,
    }
}

fn map_store_err(url: &Url, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::FileNotFound(url.to_string()),
        object_store::Error::AlreadyExists { .. } => Error::FileAlreadyExists(url.to_string()),
        source => Error::StoreUnavailable {
            location: url.to_string(),
            source,
        },
    }
}
